//! Retention and replication policies

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Result, SyncError};

/// Default number of newest snapshots kept regardless of buckets
pub const DEFAULT_EXTRA: usize = 25;

/// Calendar unit a retention count applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionUnit {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionUnit {
    pub const ALL: [RetentionUnit; 5] = [
        RetentionUnit::Hourly,
        RetentionUnit::Daily,
        RetentionUnit::Weekly,
        RetentionUnit::Monthly,
        RetentionUnit::Yearly,
    ];

    fn suffix(self) -> char {
        match self {
            RetentionUnit::Hourly => 'h',
            RetentionUnit::Daily => 'd',
            RetentionUnit::Weekly => 'w',
            RetentionUnit::Monthly => 'm',
            RetentionUnit::Yearly => 'y',
        }
    }

    fn from_suffix(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|unit| unit.suffix() == c)
    }

    /// Smallest interval at which a snapshot is worth taking for this unit
    pub fn interval_secs(self) -> u64 {
        match self {
            RetentionUnit::Hourly => 3_600,
            RetentionUnit::Daily => 86_400,
            RetentionUnit::Weekly => 7 * 86_400,
            RetentionUnit::Monthly => 28 * 86_400,
            RetentionUnit::Yearly => 365 * 86_400,
        }
    }
}

/// Per-unit keep counts plus a flat safety margin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub hourly: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub yearly: usize,
    /// Newest snapshots always kept, whatever their bucket
    pub extra: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hourly: 0,
            daily: 15,
            weekly: 3,
            monthly: 6,
            yearly: 1,
            extra: DEFAULT_EXTRA,
        }
    }
}

impl RetentionPolicy {
    pub fn empty() -> Self {
        Self {
            hourly: 0,
            daily: 0,
            weekly: 0,
            monthly: 0,
            yearly: 0,
            extra: DEFAULT_EXTRA,
        }
    }

    pub fn with_extra(mut self, extra: usize) -> Self {
        self.extra = extra;
        self
    }

    pub fn with(mut self, unit: RetentionUnit, count: usize) -> Self {
        *self.count_mut(unit) = count;
        self
    }

    pub fn count(&self, unit: RetentionUnit) -> usize {
        match unit {
            RetentionUnit::Hourly => self.hourly,
            RetentionUnit::Daily => self.daily,
            RetentionUnit::Weekly => self.weekly,
            RetentionUnit::Monthly => self.monthly,
            RetentionUnit::Yearly => self.yearly,
        }
    }

    fn count_mut(&mut self, unit: RetentionUnit) -> &mut usize {
        match unit {
            RetentionUnit::Hourly => &mut self.hourly,
            RetentionUnit::Daily => &mut self.daily,
            RetentionUnit::Weekly => &mut self.weekly,
            RetentionUnit::Monthly => &mut self.monthly,
            RetentionUnit::Yearly => &mut self.yearly,
        }
    }

    /// Units with a non-zero count, finest first
    pub fn units(&self) -> impl Iterator<Item = (RetentionUnit, usize)> + '_ {
        RetentionUnit::ALL
            .into_iter()
            .map(|unit| (unit, self.count(unit)))
            .filter(|(_, count)| *count > 0)
    }

    /// Interval of the finest configured unit; the scheduler should not
    /// dispatch more often than this
    pub fn backup_interval_secs(&self) -> Option<u64> {
        self.units().next().map(|(unit, _)| unit.interval_secs())
    }
}

/// Parses the compact notation, e.g. `1y,6m,3w,15d` or `48h,30d`
impl FromStr for RetentionPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let mut policy = RetentionPolicy::empty();
        let mut seen = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let invalid = || SyncError::Config(format!("invalid retention {:?} in {:?}", part, s));
            let suffix = part.chars().last().ok_or_else(invalid)?;
            let unit = RetentionUnit::from_suffix(suffix).ok_or_else(invalid)?;
            let count: usize = part[..part.len() - 1].parse().map_err(|_| invalid())?;
            if seen.contains(&unit) {
                return Err(SyncError::Config(format!("retention unit repeated in {:?}", s)));
            }
            seen.push(unit);
            policy = policy.with(unit, count);
        }
        if seen.is_empty() {
            return Err(SyncError::Config("empty retention policy".to_string()));
        }
        Ok(policy)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .units()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|(unit, count)| format!("{}{}", count, unit.suffix()))
            .collect();
        write!(f, "{} (+{} extra)", parts.join(","), self.extra)
    }
}

/// Everything a run needs to know about how to replicate one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetPolicy {
    /// Either the compact notation or a table of counts
    #[serde(deserialize_with = "retention_notation_or_table")]
    pub retention: RetentionPolicy,
    /// Snapshots spanned by one incremental stream, counting the ancestor
    pub max_snapshots_per_run: usize,
    /// Allow destroying local snapshots the remote never had
    pub force_overwrite: bool,
    /// Incrementals attempted right after an initial transfer
    pub follow_up_incrementals: u32,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            max_snapshots_per_run: 8,
            force_overwrite: false,
            follow_up_incrementals: 2,
        }
    }
}

fn retention_notation_or_table<'de, D>(deserializer: D) -> std::result::Result<RetentionPolicy, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Notation(String),
        Table(RetentionPolicy),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Notation(notation) => notation.parse().map_err(serde::de::Error::custom),
        Repr::Table(policy) => Ok(policy),
    }
}

impl TargetPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_snapshots_per_run < 2 {
            return Err(SyncError::Config(format!(
                "max_snapshots_per_run must be at least 2, got {}",
                self.max_snapshots_per_run
            )));
        }
        Ok(())
    }
}
