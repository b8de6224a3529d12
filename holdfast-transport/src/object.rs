//! Object-storage bulk copy
//!
//! The source is a bucket path with no snapshot history of its own. Its
//! remote listing is the local history plus one virtual snapshot named for
//! the current minute; transferring that snapshot means `rclone sync` into
//! the dataset's mountpoint followed by a local `zfs snapshot`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use holdfast_sync::{
    Endpoint, ProgressHandle, Result, Side, Snapshot, SnapshotNaming, SnapshotStore, SyncError,
    Target, TransferMode, TransferPlan, Transport, TransportKind,
};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::command;
use crate::zfs::ZfsStore;

/// Where one object-storage target copies from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSource {
    pub source_url: String,
    pub local: Endpoint,
    pub owner_tag: Option<String>,
}

fn sources(targets: &[Target]) -> impl Iterator<Item = (&Target, ObjectSource)> {
    targets
        .iter()
        .filter(|t| t.transport == TransportKind::ObjectStorage)
        .filter_map(|t| {
            let source_url = t.source_url.clone()?;
            Some((
                t,
                ObjectSource {
                    source_url,
                    local: t.local.clone(),
                    owner_tag: t.owner_tag.clone(),
                },
            ))
        })
}

#[derive(Debug, Deserialize)]
struct RcloneSize {
    bytes: i64,
}

/// Bytes reported by `rclone size --json`
pub fn parse_rclone_size(output: &str) -> std::result::Result<u64, String> {
    let size: RcloneSize = serde_json::from_str(output.trim()).map_err(|e| e.to_string())?;
    u64::try_from(size.bytes).map_err(|_| format!("negative size {}", size.bytes))
}

#[derive(Debug, Clone)]
pub struct ObjectTransport {
    sources: HashMap<String, ObjectSource>,
    store: ZfsStore,
    rclone: String,
}

impl ObjectTransport {
    pub fn new(targets: &[Target], store: ZfsStore) -> Self {
        Self {
            sources: sources(targets)
                .map(|(t, source)| (t.target_id.clone(), source))
                .collect(),
            store,
            rclone: "rclone".to_string(),
        }
    }

    /// Use another `rclone` executable
    pub fn with_rclone(mut self, rclone: impl Into<String>) -> Self {
        self.rclone = rclone.into();
        self
    }

    fn source(&self, plan: &TransferPlan) -> Result<&ObjectSource> {
        self.sources.get(&plan.target_id).ok_or_else(|| {
            SyncError::Config(format!("no object source configured for {}", plan.target_id))
        })
    }

    fn rclone(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.rclone);
        command.args(args).kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Transport for ObjectTransport {
    async fn estimate_size(&self, plan: &TransferPlan) -> Result<u64> {
        let source = self.source(plan)?;
        let output = command::run_checked(
            self.rclone(&["size", "--json", &source.source_url]),
            Side::Remote,
            "rclone size",
        )
        .await?;
        parse_rclone_size(&output.stdout).map_err(|detail| {
            SyncError::SizeUnavailable(format!("rclone size of {}: {}", source.source_url, detail))
        })
    }

    async fn transfer(&self, plan: &TransferPlan, progress: &ProgressHandle) -> Result<u64> {
        let source = self.source(plan)?;
        if plan.mode == TransferMode::Initial {
            self.store.ensure_dataset(&plan.dataset.local).await?;
        }
        let mountpoint = self.store.mountpoint(&plan.dataset.local).await?;
        debug!("Syncing {} into {}", source.source_url, mountpoint);

        let output = command::run(
            self.rclone(&["sync", "--stats-one-line", &source.source_url, &mountpoint]),
            Side::Remote,
            "rclone sync",
        )
        .await?;
        if !output.success() {
            return Err(SyncError::TransferInterrupted(format!(
                "rclone sync of {}: {}",
                source.source_url,
                output.summary()
            )));
        }

        self.store
            .create_snapshot(&plan.dataset.local, &plan.to.name, source.owner_tag.as_deref())
            .await?;

        // rclone reports no reliable byte count for a sync; the estimate
        // stands in for it.
        let bytes = progress.estimated().saturating_sub(progress.transferred());
        progress.add(bytes);
        info!("Synced {} into {}", source.source_url, plan.dataset.local);
        Ok(bytes)
    }

    async fn verify(&self, plan: &TransferPlan) -> Result<bool> {
        let snapshots = self.store.list_snapshots(&plan.dataset.local).await?;
        Ok(snapshots.iter().any(|s| s.name == plan.to.name))
    }
}

/// Remote side of object-storage targets
///
/// Lists the local history plus a virtual snapshot for the current minute.
/// Nothing on the remote side is ever destroyed or rolled back.
#[derive(Debug, Clone)]
pub struct ObjectRemoteStore {
    locals: HashMap<Endpoint, ObjectSource>,
    local_store: ZfsStore,
    naming: SnapshotNaming,
}

impl ObjectRemoteStore {
    pub fn new(targets: &[Target], local_store: ZfsStore, naming: SnapshotNaming) -> Self {
        Self {
            locals: sources(targets)
                .map(|(t, source)| (t.remote.clone(), source))
                .collect(),
            local_store,
            naming,
        }
    }

    /// Snapshot the next transfer would create at `now`
    pub fn virtual_snapshot(&self, source: &ObjectSource, now: DateTime<Utc>) -> Snapshot {
        let at = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let snapshot = Snapshot::new(self.naming.format(at), at);
        match &source.owner_tag {
            Some(tag) => snapshot.with_owner(tag.clone()),
            None => snapshot,
        }
    }

    /// Local history merged with the virtual snapshot for `now`
    pub fn listing(&self, local: Vec<Snapshot>, source: &ObjectSource, now: DateTime<Utc>) -> Vec<Snapshot> {
        let pending = self.virtual_snapshot(source, now);
        let mut snapshots = local;
        if !snapshots.iter().any(|s| s.name == pending.name) {
            snapshots.push(pending);
        }
        snapshots
    }

    fn read_only(endpoint: &Endpoint, what: &str) -> SyncError {
        SyncError::Config(format!("cannot {} on object source {}", what, endpoint))
    }
}

#[async_trait]
impl SnapshotStore for ObjectRemoteStore {
    async fn list_snapshots(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>> {
        let source = self.locals.get(endpoint).ok_or_else(|| {
            SyncError::unreachable(Side::Remote, format!("{} is not an object source", endpoint))
        })?;
        let local = self.local_store.list_snapshots(&source.local).await?;
        Ok(self.listing(local, source, Utc::now()))
    }

    async fn list_children(&self, _endpoint: &Endpoint) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn destroy_snapshot(&self, endpoint: &Endpoint, _name: &str) -> Result<()> {
        Err(Self::read_only(endpoint, "destroy snapshots"))
    }

    async fn rollback(&self, endpoint: &Endpoint, _name: &str) -> Result<()> {
        Err(Self::read_only(endpoint, "roll back"))
    }
}
