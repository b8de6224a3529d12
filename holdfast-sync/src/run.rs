//! Run lifecycle
//!
//! A [`Run`] walks `Pending → Locked → Resolving → Planning → Transferring →
//! Pruning` and ends in exactly one terminal state. Any non-terminal state
//! may fail or be cancelled; a run whose resolution or planning failed for
//! every dataset never enters `Transferring`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{Result, SyncError};
use crate::planner::TransferMode;
use crate::snapshot::DatasetPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Locked,
    Resolving,
    Planning,
    Transferring,
    Pruning,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::PartiallySucceeded
                | RunState::Failed
                | RunState::Cancelled
        )
    }

    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Locked)
                | (Locked, Resolving)
                | (Resolving, Planning)
                | (Planning, Transferring)
                | (Planning, Succeeded)
                | (Planning, PartiallySucceeded)
                | (Transferring, Pruning)
                | (Transferring, Succeeded)
                | (Transferring, PartiallySucceeded)
                | (Pruning, Succeeded)
                | (Pruning, PartiallySucceeded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Locked => "locked",
            RunState::Resolving => "resolving",
            RunState::Planning => "planning",
            RunState::Transferring => "transferring",
            RunState::Pruning => "pruning",
            RunState::Succeeded => "succeeded",
            RunState::PartiallySucceeded => "partially_succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        use RunState::*;
        [
            Pending,
            Locked,
            Resolving,
            Planning,
            Transferring,
            Pruning,
            Succeeded,
            PartiallySucceeded,
            Failed,
            Cancelled,
        ]
        .into_iter()
        .find(|state| state.as_str() == value)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Pending,
    /// Nothing newer on the remote side
    UpToDate,
    Transferred,
    Failed,
    Cancelled,
}

impl DatasetStatus {
    pub fn is_success(self) -> bool {
        matches!(self, DatasetStatus::UpToDate | DatasetStatus::Transferred)
    }
}

/// What happened to one dataset of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetResult {
    pub dataset: DatasetPair,
    pub status: DatasetStatus,
    pub mode: Option<TransferMode>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub bytes: u64,
    pub estimated_bytes: u64,
    pub follow_ups_completed: u32,
    /// Remote snapshots still newer than the local newest after this run
    pub remaining: usize,
    pub pruned: Vec<String>,
    pub prune_failures: Vec<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl DatasetResult {
    pub fn new(dataset: DatasetPair) -> Self {
        Self {
            dataset,
            status: DatasetStatus::Pending,
            mode: None,
            from: None,
            to: None,
            bytes: 0,
            estimated_bytes: 0,
            follow_ups_completed: 0,
            remaining: 0,
            pruned: Vec::new(),
            prune_failures: Vec::new(),
            error: None,
            error_kind: None,
        }
    }

    pub fn fail(&mut self, err: &SyncError) {
        self.status = if matches!(err, SyncError::Cancelled) {
            DatasetStatus::Cancelled
        } else {
            DatasetStatus::Failed
        };
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
    }

    pub fn is_settled(&self) -> bool {
        self.status != DatasetStatus::Pending
    }
}

/// One execution of the pipeline for a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub target_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: RunState,
    pub transferred_bytes: u64,
    pub error_detail: Option<String>,
    pub error_kind: Option<String>,
    /// Consecutive failures of the target before this run
    pub retry_count: u32,
    pub datasets: Vec<DatasetResult>,
}

impl Run {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            target_id: target_id.into(),
            start_time: Utc::now(),
            end_time: None,
            state: RunState::Pending,
            transferred_bytes: 0,
            error_detail: None,
            error_kind: None,
            retry_count: 0,
            datasets: Vec::new(),
        }
    }

    pub fn transition(&mut self, to: RunState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Terminal state implied by the dataset results
    pub fn outcome(&self) -> RunState {
        if self.datasets.iter().any(|d| d.status == DatasetStatus::Cancelled) {
            return RunState::Cancelled;
        }
        let succeeded = self.datasets.iter().filter(|d| d.status.is_success()).count();
        if succeeded == self.datasets.len() {
            RunState::Succeeded
        } else if succeeded == 0 {
            RunState::Failed
        } else {
            RunState::PartiallySucceeded
        }
    }

    /// Move to the outcome implied by the dataset results
    pub fn settle(&mut self) -> Result<RunState> {
        let outcome = self.outcome();
        self.transferred_bytes = self.datasets.iter().map(|d| d.bytes).sum();
        if outcome != RunState::Succeeded && self.error_detail.is_none() {
            if let Some(failed) = self.datasets.iter().find(|d| d.error.is_some()) {
                self.error_detail = failed
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", failed.dataset, e));
                self.error_kind = failed.error_kind.clone();
            }
        }
        self.transition(outcome)?;
        Ok(outcome)
    }

    /// End the run as failed with a run-level error
    pub fn fail(&mut self, err: &SyncError) -> Result<()> {
        self.error_detail = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
        let to = if matches!(err, SyncError::Cancelled) {
            RunState::Cancelled
        } else {
            RunState::Failed
        };
        self.transition(to)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Datasets eligible for pruning: transferred or already current
    pub fn prunable(&self) -> impl Iterator<Item = &DatasetResult> {
        self.datasets.iter().filter(|d| d.status.is_success())
    }
}
