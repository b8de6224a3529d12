//! Error types for replication runs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::Side;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{side} side unreachable: {detail}")]
    Unreachable { side: Side, detail: String },

    #[error("Remote dataset has no snapshot history: {0}")]
    NoRemoteHistory(String),

    #[error("No common snapshot between local and remote history of {0}")]
    NoCommonSnapshot(String),

    #[error("Local history of {dataset} diverged from remote: {}", .newer_local.join(", "))]
    DivergedHistory {
        dataset: String,
        newer_local: Vec<String>,
    },

    #[error("Transfer interrupted: {0}")]
    TransferInterrupted(String),

    #[error("Destination busy: {0}")]
    DestinationBusy(String),

    #[error("Transfer size unavailable: {0}")]
    SizeUnavailable(String),

    #[error("Failed to destroy snapshot {snapshot}: {detail}")]
    PruneFailure { snapshot: String, detail: String },

    #[error("A run is already active for target: {0}")]
    AlreadyRunning(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid state transition: from {from:?} to {to:?}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a run should treat an error once it reaches the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Broken configuration, retrying cannot help
    Fatal,
    /// Try again at the next scheduled dispatch, never mid-run
    RetryNextDispatch,
    /// Histories cannot be reconciled without an operator
    NeedsOperator,
    /// Local drift; an operator must decide on a forced overwrite
    NeedsForceDecision,
    /// Nothing committed, the same ancestor can be reused
    RetrySameAncestor,
    /// Not logged as a failure at all
    Cancelled,
}

impl SyncError {
    pub fn unreachable(side: Side, detail: impl Into<String>) -> Self {
        SyncError::Unreachable {
            side,
            detail: detail.into(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            SyncError::Config(_) | SyncError::InvalidStateTransition { .. } => Disposition::Fatal,
            SyncError::Unreachable { .. }
            | SyncError::NoRemoteHistory(_)
            | SyncError::SizeUnavailable(_)
            | SyncError::Timeout(_)
            | SyncError::AlreadyRunning(_)
            | SyncError::Database(_)
            | SyncError::Io(_)
            | SyncError::Serialization(_)
            | SyncError::Internal(_) => Disposition::RetryNextDispatch,
            SyncError::NoCommonSnapshot(_) => Disposition::NeedsOperator,
            SyncError::DivergedHistory { .. } => Disposition::NeedsForceDecision,
            SyncError::TransferInterrupted(_)
            | SyncError::DestinationBusy(_)
            | SyncError::PruneFailure { .. } => Disposition::RetrySameAncestor,
            SyncError::Cancelled => Disposition::Cancelled,
        }
    }

    /// Short, stable identifier stored alongside the run history
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "config",
            SyncError::Unreachable { .. } => "unreachable",
            SyncError::NoRemoteHistory(_) => "no_remote_history",
            SyncError::NoCommonSnapshot(_) => "no_common_snapshot",
            SyncError::DivergedHistory { .. } => "diverged_history",
            SyncError::TransferInterrupted(_) => "transfer_interrupted",
            SyncError::DestinationBusy(_) => "destination_busy",
            SyncError::SizeUnavailable(_) => "size_unavailable",
            SyncError::PruneFailure { .. } => "prune_failure",
            SyncError::AlreadyRunning(_) => "already_running",
            SyncError::Cancelled => "cancelled",
            SyncError::InvalidStateTransition { .. } => "invalid_state_transition",
            SyncError::Timeout(_) => "timeout",
            SyncError::Database(_) => "database",
            SyncError::Io(_) => "io",
            SyncError::Serialization(_) => "serialization",
            SyncError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
