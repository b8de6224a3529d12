//! Common ancestor resolution between local and remote histories

use tracing::debug;

use crate::errors::{Result, SyncError};
use crate::history::SnapshotHistory;
use crate::snapshot::{DatasetPair, Snapshot};

/// What the two captured histories say about the next transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// Local has no history yet
    Initial,
    /// Local shares a snapshot with remote and is behind or diverged
    Incremental,
    /// Both sides end on the same snapshot
    UpToDate,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub dataset: DatasetPair,
    pub kind: ResolutionKind,
    /// Newest snapshot present on both sides
    pub common: Option<Snapshot>,
    /// Newest remote snapshot
    pub remote_target: Snapshot,
    /// Remote snapshots newer than `common`, oldest first. For an initial
    /// resolution this is the whole remote history.
    pub remote_newer: Vec<Snapshot>,
    /// Local snapshots newer than `common` that remote does not have,
    /// newest first
    pub newer_local_snapshots: Vec<Snapshot>,
}

impl Resolution {
    pub fn is_diverged(&self) -> bool {
        !self.newer_local_snapshots.is_empty()
    }
}

/// Finds the newest snapshot shared by a local and a remote history
#[derive(Debug, Default, Clone, Copy)]
pub struct AncestorResolver;

impl AncestorResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, local: &SnapshotHistory, remote: &SnapshotHistory) -> Result<Resolution> {
        let dataset = DatasetPair::new(remote.endpoint().clone(), local.endpoint().clone());

        let remote_newest = match remote.newest() {
            Some(newest) => newest.clone(),
            None => return Err(SyncError::NoRemoteHistory(remote.endpoint().to_string())),
        };

        if local.is_empty() {
            debug!("No local history for {}, initial transfer required", dataset);
            return Ok(Resolution {
                dataset,
                kind: ResolutionKind::Initial,
                common: None,
                remote_target: remote_newest,
                remote_newer: remote.iter().rev().cloned().collect(),
                newer_local_snapshots: Vec::new(),
            });
        }

        if local.newest().map(|s| s.name.as_str()) == Some(remote_newest.name.as_str()) {
            return Ok(Resolution {
                dataset,
                kind: ResolutionKind::UpToDate,
                common: Some(remote_newest.clone()),
                remote_target: remote_newest,
                remote_newer: Vec::new(),
                newer_local_snapshots: Vec::new(),
            });
        }

        let remote_names = remote.names();
        let local_index = local
            .iter()
            .position(|s| remote_names.contains(s.name.as_str()))
            .ok_or_else(|| SyncError::NoCommonSnapshot(dataset.to_string()))?;

        let common = local.snapshots()[local_index].clone();
        let newer_local_snapshots = local.snapshots()[..local_index].to_vec();

        let remote_index = remote
            .iter()
            .position(|s| s.name == common.name)
            .ok_or_else(|| SyncError::Internal(format!("{} vanished from remote index", common.name)))?;
        let remote_newer: Vec<Snapshot> = remote.snapshots()[..remote_index]
            .iter()
            .rev()
            .cloned()
            .collect();

        let kind = if remote_newer.is_empty() && newer_local_snapshots.is_empty() {
            ResolutionKind::UpToDate
        } else {
            ResolutionKind::Incremental
        };

        debug!(
            "Resolved {}: common={} remote_newer={} newer_local={}",
            dataset,
            common.name,
            remote_newer.len(),
            newer_local_snapshots.len()
        );

        Ok(Resolution {
            dataset,
            kind,
            common: Some(common),
            remote_target: remote_newest,
            remote_newer,
            newer_local_snapshots,
        })
    }
}
