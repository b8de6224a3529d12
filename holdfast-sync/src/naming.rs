//! Snapshot naming convention
//!
//! Snapshots created by this engine are named `<prefix>-YYYYMMDDTHHMMZ`, a
//! UTC timestamp in compact ISO 8601 basic format at minute resolution. The
//! format is persisted state: existing histories are only recognised while it
//! stays the same, so the state store records the scheme and refuses to open
//! under a different one.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::errors::{Result, SyncError};

/// Version of the naming scheme recorded in the state store
pub const NAMING_SCHEME_VERSION: u32 = 1;

/// Default snapshot name prefix
pub const DEFAULT_PREFIX: &str = "holdfast";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%MZ";
const TIMESTAMP_LEN: usize = 14;

/// Formats and recognises snapshot names for one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNaming {
    prefix: String,
}

impl SnapshotNaming {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Identifier stored by the state store, e.g. `v1:holdfast`
    pub fn scheme_id(&self) -> String {
        format!("v{}:{}", NAMING_SCHEME_VERSION, self.prefix)
    }

    /// Name for a snapshot taken at `at`; seconds are truncated
    pub fn format(&self, at: DateTime<Utc>) -> String {
        format!("{}-{}", self.prefix, at.format(TIMESTAMP_FORMAT))
    }

    /// Timestamp encoded in `name`, or `None` when the name does not follow
    /// the convention
    pub fn parse(&self, name: &str) -> Option<DateTime<Utc>> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        parse_timestamp(rest)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }
}

impl Default for SnapshotNaming {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let bytes = value.as_bytes();
    if bytes.len() != TIMESTAMP_LEN || bytes[8] != b'T' || bytes[13] != b'Z' {
        return None;
    }
    let digits_ok = bytes[..8]
        .iter()
        .chain(&bytes[9..13])
        .all(|b| b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Prefixes are lowercase alphanumerics with inner dashes
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let bytes = prefix.as_bytes();
    let allowed = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let valid = match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            allowed(first) && allowed(last) && bytes.iter().all(|b| allowed(b) || *b == b'-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SyncError::Config(format!(
            "invalid snapshot prefix {:?}: expected [a-z0-9]([a-z0-9-]*[a-z0-9])?",
            prefix
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let naming = SnapshotNaming::new("planb").unwrap();
        let at = Utc.with_ymd_and_hms(2022, 1, 18, 9, 34, 59).unwrap();
        let name = naming.format(at);
        assert_eq!(name, "planb-20220118T0934Z");

        let parsed = naming.parse(&name).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 1, 18, 9, 34, 0).unwrap());
    }

    #[test]
    fn test_rejects_foreign_names() {
        let naming = SnapshotNaming::default();
        assert!(!naming.matches("manual-before-upgrade"));
        assert!(!naming.matches("holdfast-20220118T0934"));
        assert!(!naming.matches("holdfast-20220118T093400Z"));
        assert!(!naming.matches("holdfast-2022011xT0934Z"));
        assert!(!naming.matches("other-20220118T0934Z"));
        assert!(!naming.matches("holdfast-20221318T0934Z"));
        assert!(naming.matches("holdfast-20220118T0934Z"));
    }

    #[test]
    fn test_prefix_validation() {
        assert!(validate_prefix("planb").is_ok());
        assert!(validate_prefix("site-2").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("-planb").is_err());
        assert!(validate_prefix("planb-").is_err());
        assert!(validate_prefix("PlanB").is_err());
        assert!(validate_prefix("plan_b").is_err());
    }

    #[test]
    fn test_scheme_id() {
        let naming = SnapshotNaming::new("planb").unwrap();
        assert_eq!(naming.scheme_id(), "v1:planb");
    }
}
