//! In-memory snapshot store and transport
//!
//! Holds both sides of every dataset in one process for tests. Failures can
//! be injected per dataset. Built only with the `test-util` feature.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{Result, SyncError};
use crate::history::SnapshotStore;
use crate::planner::{TransferMode, TransferPlan};
use crate::progress::ProgressHandle;
use crate::snapshot::{Endpoint, Side, Snapshot};
use crate::transport::Transport;

/// Bytes a snapshot adds to a stream when it carries no size
const DEFAULT_SNAPSHOT_BYTES: u64 = 4096;

#[derive(Debug, Default)]
struct State {
    datasets: HashMap<Endpoint, Vec<Snapshot>>,
    unreachable_hosts: HashSet<String>,
    transfer_failures: HashMap<String, usize>,
    destroy_failures: HashSet<String>,
    size_override: Option<u64>,
    transfer_delay: Option<Duration>,
    panic_on_transfer: bool,
    destroyed: Vec<String>,
    rollbacks: Vec<(String, String)>,
    transfers: Vec<(Option<String>, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the dataset if needed and append `snapshot`
    pub fn add_snapshot(&self, endpoint: &Endpoint, snapshot: Snapshot) {
        self.state()
            .datasets
            .entry(endpoint.clone())
            .or_default()
            .push(snapshot);
    }

    pub fn create_dataset(&self, endpoint: &Endpoint) {
        self.state().datasets.entry(endpoint.clone()).or_default();
    }

    /// Snapshots in creation order
    pub fn snapshots(&self, endpoint: &Endpoint) -> Vec<Snapshot> {
        self.state()
            .datasets
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn names(&self, endpoint: &Endpoint) -> Vec<String> {
        self.snapshots(endpoint).into_iter().map(|s| s.name).collect()
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable_hosts.insert(host.to_string());
        } else {
            state.unreachable_hosts.remove(host);
        }
    }

    /// Fail the next `count` transfers into `local_dataset`
    pub fn fail_transfers(&self, local_dataset: &str, count: usize) {
        self.state()
            .transfer_failures
            .insert(local_dataset.to_string(), count);
    }

    pub fn fail_destroy(&self, snapshot: &str) {
        self.state().destroy_failures.insert(snapshot.to_string());
    }

    pub fn set_size_override(&self, size: Option<u64>) {
        self.state().size_override = size;
    }

    pub fn set_transfer_delay(&self, delay: Option<Duration>) {
        self.state().transfer_delay = delay;
    }

    pub fn set_panic_on_transfer(&self, panic: bool) {
        self.state().panic_on_transfer = panic;
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    /// `(dataset, snapshot)` pairs rolled back to
    pub fn rollbacks(&self) -> Vec<(String, String)> {
        self.state().rollbacks.clone()
    }

    /// `(from, to)` of every completed transfer
    pub fn transfers(&self) -> Vec<(Option<String>, String)> {
        self.state().transfers.clone()
    }

    fn check_reachable(state: &State, endpoint: &Endpoint, side: Side) -> Result<()> {
        match &endpoint.host {
            Some(host) if state.unreachable_hosts.contains(host) => Err(SyncError::unreachable(
                side,
                format!("ssh: connect to host {} port 22: Connection refused", host),
            )),
            _ => Ok(()),
        }
    }

    /// Remote snapshots a plan streams, oldest first
    fn stream_contents(state: &State, plan: &TransferPlan) -> Result<Vec<Snapshot>> {
        Self::check_reachable(state, &plan.dataset.remote, Side::Remote)?;
        let remote = state
            .datasets
            .get(&plan.dataset.remote)
            .ok_or_else(|| SyncError::unreachable(Side::Remote, "dataset does not exist"))?;
        let mut ordered = remote.clone();
        ordered.sort_by_key(|s| s.created_at);

        let to_index = ordered
            .iter()
            .position(|s| s.name == plan.to.name)
            .ok_or_else(|| {
                SyncError::TransferInterrupted(format!("snapshot {} vanished", plan.to.name))
            })?;
        let start = match (plan.mode, plan.from_name()) {
            (TransferMode::Incremental, Some(from)) => {
                ordered
                    .iter()
                    .position(|s| s.name == from)
                    .ok_or_else(|| {
                        SyncError::TransferInterrupted(format!("incremental source {} vanished", from))
                    })?
                    + 1
            }
            _ => to_index,
        };
        if start > to_index {
            return Err(SyncError::TransferInterrupted(format!(
                "{} is not newer than its source",
                plan.to.name
            )));
        }
        Ok(ordered[start..=to_index].to_vec())
    }
}

#[async_trait]
impl SnapshotStore for MemoryBackend {
    async fn list_snapshots(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>> {
        let state = self.state();
        let side = if endpoint.host.is_some() {
            Side::Remote
        } else {
            Side::Local
        };
        Self::check_reachable(&state, endpoint, side)?;
        Ok(state.datasets.get(endpoint).cloned().unwrap_or_default())
    }

    async fn list_children(&self, endpoint: &Endpoint) -> Result<Vec<String>> {
        let state = self.state();
        Self::check_reachable(&state, endpoint, Side::Remote)?;
        let mut children: Vec<String> = state
            .datasets
            .keys()
            .filter(|e| e.host == endpoint.host && endpoint.relative(&e.dataset).is_some())
            .map(|e| e.dataset.clone())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn destroy_snapshot(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.destroy_failures.contains(name) {
            return Err(SyncError::unreachable(
                Side::Local,
                format!("cannot destroy snapshot {}@{}: dataset is busy", endpoint, name),
            ));
        }
        let snapshots = state.datasets.get_mut(endpoint).ok_or_else(|| {
            SyncError::unreachable(Side::Local, format!("{}: dataset does not exist", endpoint))
        })?;
        let before = snapshots.len();
        snapshots.retain(|s| s.name != name);
        if snapshots.len() == before {
            return Err(SyncError::unreachable(
                Side::Local,
                format!("could not find snapshot {}@{}", endpoint, name),
            ));
        }
        state.destroyed.push(name.to_string());
        Ok(())
    }

    async fn rollback(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
        let mut state = self.state();
        let snapshots = state.datasets.get(endpoint).ok_or_else(|| {
            SyncError::unreachable(Side::Local, format!("{}: dataset does not exist", endpoint))
        })?;
        if !snapshots.iter().any(|s| s.name == name) {
            return Err(SyncError::unreachable(
                Side::Local,
                format!("could not find snapshot {}@{}", endpoint, name),
            ));
        }
        state
            .rollbacks
            .push((endpoint.dataset.clone(), name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBackend {
    async fn estimate_size(&self, plan: &TransferPlan) -> Result<u64> {
        let state = self.state();
        let contents = Self::stream_contents(&state, plan)?;
        if let Some(size) = state.size_override {
            return Ok(size);
        }
        Ok(contents
            .iter()
            .map(|s| s.size_bytes.unwrap_or(DEFAULT_SNAPSHOT_BYTES))
            .sum())
    }

    async fn transfer(&self, plan: &TransferPlan, progress: &ProgressHandle) -> Result<u64> {
        let delay = self.state().transfer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.panic_on_transfer {
            drop(state);
            panic!("transport crashed while streaming {}", plan.to.name);
        }
        if let Some(remaining) = state.transfer_failures.get_mut(&plan.dataset.local.dataset) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::TransferInterrupted(format!(
                    "cannot receive {}: broken pipe",
                    plan.dataset.local
                )));
            }
        }

        let contents = Self::stream_contents(&state, plan)?;
        let bytes: u64 = contents
            .iter()
            .map(|s| s.size_bytes.unwrap_or(DEFAULT_SNAPSHOT_BYTES))
            .sum();

        let local = state
            .datasets
            .entry(plan.dataset.local.clone())
            .or_default();
        if plan.force_overwrite {
            if let Some(from) = &plan.from {
                local.retain(|s| s.created_at <= from.created_at);
            }
        }
        if plan.mode == TransferMode::Initial && !local.is_empty() {
            return Err(SyncError::DestinationBusy(format!(
                "destination {} exists and has snapshots",
                plan.dataset.local
            )));
        }
        for snapshot in contents {
            if !local.iter().any(|s| s.name == snapshot.name) {
                local.push(snapshot);
            }
        }
        state
            .transfers
            .push((plan.from_name().map(str::to_string), plan.to.name.clone()));
        progress.add(bytes);
        Ok(bytes)
    }

    async fn verify(&self, plan: &TransferPlan) -> Result<bool> {
        let state = self.state();
        Ok(state
            .datasets
            .get(&plan.dataset.local)
            .map_or(false, |snapshots| snapshots.iter().any(|s| s.name == plan.to.name)))
    }
}
