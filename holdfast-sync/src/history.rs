//! Snapshot history queries
//!
//! A [`SnapshotHistory`] is an immutable, newest-first capture of one side of
//! one dataset, taken at the start of a run. Resolution and planning only ever
//! look at captured histories, never at the live dataset.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::errors::{Result, SyncError};
use crate::naming::SnapshotNaming;
use crate::snapshot::{Endpoint, Side, Snapshot};

/// Snapshot-level operations on datasets, local or behind a remote shell
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// All snapshots of the dataset, in any order, unfiltered
    async fn list_snapshots(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>>;

    /// Full names of the datasets below `endpoint`, excluding itself
    async fn list_children(&self, endpoint: &Endpoint) -> Result<Vec<String>>;

    /// Destroy one snapshot
    async fn destroy_snapshot(&self, endpoint: &Endpoint, name: &str) -> Result<()>;

    /// Roll the dataset back to `name`, discarding later changes
    async fn rollback(&self, endpoint: &Endpoint, name: &str) -> Result<()>;
}

/// Which snapshots belong to this engine and target
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub naming: SnapshotNaming,
    pub owner_tag: Option<String>,
}

impl HistoryFilter {
    pub fn new(naming: SnapshotNaming, owner_tag: Option<String>) -> Self {
        Self { naming, owner_tag }
    }

    /// Untagged snapshots are accepted; a different tag is not
    pub fn accepts(&self, snapshot: &Snapshot) -> bool {
        if !self.naming.matches(&snapshot.name) {
            return false;
        }
        match (&self.owner_tag, &snapshot.owner_tag) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }
}

/// Newest-first snapshots of one side of one dataset
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    side: Side,
    endpoint: Endpoint,
    snapshots: Vec<Snapshot>,
}

impl SnapshotHistory {
    /// Query `store` and capture the filtered history
    ///
    /// An unreachable dataset and an empty history are different outcomes:
    /// the first is an error, the second an empty capture.
    pub async fn list(
        store: &dyn SnapshotStore,
        endpoint: &Endpoint,
        side: Side,
        filter: &HistoryFilter,
        control_timeout: Duration,
    ) -> Result<Self> {
        let raw = match tokio::time::timeout(control_timeout, store.list_snapshots(endpoint)).await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(as_unreachable(side, e)),
            Err(_) => {
                return Err(SyncError::unreachable(
                    side,
                    format!("listing {} timed out after {:?}", endpoint, control_timeout),
                ))
            }
        };
        let history = Self::capture(side, endpoint.clone(), raw, filter)?;
        debug!(
            "Captured {} history of {}: {} snapshots",
            side,
            endpoint,
            history.len()
        );
        Ok(history)
    }

    /// Filter and order raw listing output
    pub fn capture(
        side: Side,
        endpoint: Endpoint,
        raw: Vec<Snapshot>,
        filter: &HistoryFilter,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for snapshot in &raw {
            if !seen.insert(snapshot.name.as_str()) {
                return Err(SyncError::unreachable(
                    side,
                    format!("duplicate snapshot {} in listing of {}", snapshot.name, endpoint),
                ));
            }
        }

        let mut snapshots: Vec<Snapshot> = raw.into_iter().filter(|s| filter.accepts(s)).collect();
        let naming = &filter.naming;
        snapshots.sort_by_cached_key(|s| {
            Reverse((s.created_at, naming.parse(&s.name), s.name.clone()))
        });

        Ok(Self {
            side,
            endpoint,
            snapshots,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn newest(&self) -> Option<&Snapshot> {
        self.snapshots.first()
    }

    pub fn oldest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Newest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Snapshot> + ExactSizeIterator {
        self.snapshots.iter()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn get(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> HashSet<&str> {
        self.snapshots.iter().map(|s| s.name.as_str()).collect()
    }

    /// Creation time of the newest snapshot
    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        self.newest().map(|s| s.created_at)
    }
}

fn as_unreachable(side: Side, err: SyncError) -> SyncError {
    match err {
        SyncError::Unreachable { detail, .. } => SyncError::unreachable(side, detail),
        SyncError::Config(_) | SyncError::Cancelled => err,
        other => SyncError::unreachable(side, other.to_string()),
    }
}
