//! Snapshot replication and retention engine for holdfast
//!
//! This crate provides the engine that keeps local replicas of remote ZFS
//! datasets current:
//! - Snapshot history capture and common-ancestor resolution
//! - Transfer planning and execution through pluggable transports
//! - Retention pruning of the local replica
//! - Per-target locking, run history and failure escalation in SQLite
//! - Run coordination, cancellation and progress reporting

pub mod alerts;
pub mod ancestor;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod executor;
pub mod history;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod naming;
pub mod planner;
pub mod policy;
pub mod progress;
pub mod recovery;
pub mod retention;
pub mod run;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use alerts::{Alert, AlertSink, ChannelAlertSink, TracingAlertSink};
pub use ancestor::{AncestorResolver, Resolution, ResolutionKind};
pub use config::{
    ConfigStore, EncryptionMode, EngineConfig, FileConfigStore, HoldfastConfig,
    StaticConfigStore, Target, TransportKind,
};
pub use coordinator::RunCoordinator;
pub use errors::{Disposition, Result, SyncError};
pub use executor::{TransferExecutor, TransferReport};
pub use history::{HistoryFilter, SnapshotHistory, SnapshotStore};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBackend;
pub use naming::SnapshotNaming;
pub use planner::{PlanDecision, TransferMode, TransferPlan, TransferPlanner, WireMode};
pub use policy::{RetentionPolicy, RetentionUnit, TargetPolicy};
pub use progress::{ProgressHandle, RunProgress};
pub use recovery::{RecoveryStats, RecoverySweep};
pub use retention::{keep_set, PruneReport, RetentionPruner};
pub use run::{DatasetResult, DatasetStatus, Run, RunState};
pub use scheduler::DispatchQueue;
pub use snapshot::{DatasetPair, Endpoint, Side, Snapshot};
pub use state::{AsyncStateStore, LockRecord, StateStore, TargetHealth};
pub use transport::{Transport, TransportRegistry};
