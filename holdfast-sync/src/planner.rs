//! Transfer planning
//!
//! Turns a [`Resolution`] into the bounds of the next transfer. Planning is
//! pure: it never touches a dataset.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::ancestor::{Resolution, ResolutionKind};
use crate::config::{EncryptionMode, Target};
use crate::errors::{Result, SyncError};
use crate::policy::TargetPolicy;
use crate::snapshot::{DatasetPair, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Full stream of one snapshot into an empty local dataset
    Initial,
    /// Delta between two snapshots
    Incremental,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Initial => write!(f, "initial"),
            TransferMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// How snapshot data is encoded on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    Plain,
    /// Blocks sent as stored on disk, compressed
    Compressed,
    /// Encrypted blocks sent unchanged; keys never leave the source
    Raw,
}

impl WireMode {
    pub fn for_target(target: &Target) -> Self {
        match (target.encryption, target.compressed) {
            (EncryptionMode::Raw, _) => WireMode::Raw,
            (EncryptionMode::None, true) => WireMode::Compressed,
            (EncryptionMode::None, false) => WireMode::Plain,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WireMode::Plain => "plain",
            WireMode::Compressed => "compressed",
            WireMode::Raw => "raw",
        }
    }
}

/// Bounds of one transfer for one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub target_id: String,
    pub dataset: DatasetPair,
    pub mode: TransferMode,
    pub from: Option<Snapshot>,
    pub to: Snapshot,
    pub recurse: bool,
    pub wire_mode: WireMode,
    /// Destroy local state the remote never had
    pub force_overwrite: bool,
    /// Incrementals to attempt right after this plan succeeds
    pub follow_ups: u32,
    /// Remote snapshots still newer than `to`
    pub remaining: usize,
}

impl TransferPlan {
    pub fn from_name(&self) -> Option<&str> {
        self.from.as_ref().map(|s| s.name.as_str())
    }
}

impl fmt::Display for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(
                f,
                "{} {} @{}..@{}",
                self.mode, self.dataset, from.name, self.to.name
            ),
            None => write!(f, "{} {} @{}", self.mode, self.dataset, self.to.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// Nothing to transfer for this dataset
    NoOp {
        dataset: DatasetPair,
        at: Option<Snapshot>,
    },
    Transfer(TransferPlan),
}

/// Plans transfers for the datasets of one target
#[derive(Debug, Clone)]
pub struct TransferPlanner {
    target_id: String,
    recurse: bool,
    wire_mode: WireMode,
}

impl TransferPlanner {
    pub fn new(target_id: impl Into<String>, recurse: bool, wire_mode: WireMode) -> Self {
        Self {
            target_id: target_id.into(),
            recurse,
            wire_mode,
        }
    }

    pub fn for_target(target: &Target) -> Self {
        Self::new(
            target.target_id.clone(),
            target.recursive,
            WireMode::for_target(target),
        )
    }

    pub fn plan(&self, resolution: &Resolution, policy: &TargetPolicy) -> Result<PlanDecision> {
        policy.validate()?;

        match resolution.kind {
            ResolutionKind::UpToDate => Ok(PlanDecision::NoOp {
                dataset: resolution.dataset.clone(),
                at: resolution.common.clone(),
            }),
            ResolutionKind::Initial => self.plan_initial(resolution, policy),
            ResolutionKind::Incremental => self.plan_incremental(resolution, policy),
        }
    }

    /// Start from the oldest remote snapshot: the smallest stream, and the
    /// one least likely to be the newest remote snapshot pruned mid-transfer
    fn plan_initial(&self, resolution: &Resolution, policy: &TargetPolicy) -> Result<PlanDecision> {
        let to = resolution
            .remote_newer
            .first()
            .cloned()
            .ok_or_else(|| SyncError::NoRemoteHistory(resolution.dataset.remote.to_string()))?;

        let plan = TransferPlan {
            target_id: self.target_id.clone(),
            dataset: resolution.dataset.clone(),
            mode: TransferMode::Initial,
            from: None,
            to,
            recurse: self.recurse,
            wire_mode: self.wire_mode,
            force_overwrite: false,
            follow_ups: policy.follow_up_incrementals.clamp(1, 2),
            remaining: resolution.remote_newer.len() - 1,
        };
        debug!("Planned {}", plan);
        Ok(PlanDecision::Transfer(plan))
    }

    fn plan_incremental(
        &self,
        resolution: &Resolution,
        policy: &TargetPolicy,
    ) -> Result<PlanDecision> {
        if resolution.is_diverged() {
            let newer_local: Vec<String> = resolution
                .newer_local_snapshots
                .iter()
                .map(|s| s.name.clone())
                .collect();
            if !policy.force_overwrite {
                return Err(SyncError::DivergedHistory {
                    dataset: resolution.dataset.local.to_string(),
                    newer_local,
                });
            }
            warn!(
                "Local history of {} diverged ({}); overwriting as forced by policy",
                resolution.dataset.local,
                newer_local.join(", ")
            );
        }

        let from = match &resolution.common {
            Some(common) => common.clone(),
            None => return Err(SyncError::NoCommonSnapshot(resolution.dataset.to_string())),
        };

        if resolution.remote_newer.is_empty() {
            // Local drift only; the next incremental rolls it back.
            return Ok(PlanDecision::NoOp {
                dataset: resolution.dataset.clone(),
                at: Some(from),
            });
        }

        let step = (policy.max_snapshots_per_run - 1).max(1);
        let index = step.min(resolution.remote_newer.len()) - 1;
        let to = resolution.remote_newer[index].clone();

        let plan = TransferPlan {
            target_id: self.target_id.clone(),
            dataset: resolution.dataset.clone(),
            mode: TransferMode::Incremental,
            from: Some(from),
            to,
            recurse: self.recurse,
            wire_mode: self.wire_mode,
            force_overwrite: resolution.is_diverged(),
            follow_ups: 0,
            remaining: resolution.remote_newer.len() - index - 1,
        };
        debug!("Planned {} ({} remaining)", plan, plan.remaining);
        Ok(PlanDecision::Transfer(plan))
    }
}
