//! Pluggable data transports

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TransportKind;
use crate::errors::{Result, SyncError};
use crate::history::SnapshotStore;
use crate::planner::TransferPlan;
use crate::progress::ProgressHandle;

/// Moves the data described by a [`TransferPlan`]
///
/// `transfer` may be dropped at any await point when a run is cancelled.
/// Implementations spawning processes must make sure dropping the future
/// terminates them, and a receive that did not complete must leave the
/// destination at its previous snapshot.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dry-run size of the stream in bytes
    async fn estimate_size(&self, plan: &TransferPlan) -> Result<u64>;

    /// Stream the data, advancing `progress`; returns bytes moved
    async fn transfer(&self, plan: &TransferPlan, progress: &ProgressHandle) -> Result<u64>;

    /// Whether the destination now holds `plan.to`
    async fn verify(&self, plan: &TransferPlan) -> Result<bool>;
}

/// Transports by kind
///
/// A transport whose remote side is not a snapshot-capable host registers
/// its own store for remote listings; every other kind lists the remote side
/// through the engine's store.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    remote_stores: HashMap<TransportKind, Arc<dyn SnapshotStore>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TransportKind, transport: Arc<dyn Transport>) {
        self.transports.insert(kind, transport);
    }

    pub fn with(mut self, kind: TransportKind, transport: Arc<dyn Transport>) -> Self {
        self.register(kind, transport);
        self
    }

    pub fn register_with_remote_store(
        &mut self,
        kind: TransportKind,
        transport: Arc<dyn Transport>,
        remote_store: Arc<dyn SnapshotStore>,
    ) {
        self.transports.insert(kind, transport);
        self.remote_stores.insert(kind, remote_store);
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(&kind)
            .cloned()
            .ok_or_else(|| SyncError::Config(format!("no transport registered for {}", kind)))
    }

    pub fn remote_store(&self, kind: TransportKind) -> Option<Arc<dyn SnapshotStore>> {
        self.remote_stores.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.transports.keys().copied()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.transports.keys().collect::<Vec<_>>())
            .field("remote_stores", &self.remote_stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
