//! Live progress of replication runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::run::RunState;

/// Shared byte counter a transport advances while streaming
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    transferred: Arc<AtomicU64>,
    estimated: Arc<AtomicU64>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Add a dataset's dry-run estimate to the run total
    pub fn add_estimate(&self, bytes: u64) {
        self.estimated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn estimated(&self) -> u64 {
        self.estimated.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub target_id: String,
    pub state: RunState,
    pub current_dataset: Option<String>,
    pub estimated_bytes: u64,
    pub transferred_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl RunProgress {
    pub fn new(run_id: String, target_id: String) -> Self {
        Self {
            run_id,
            target_id,
            state: RunState::Pending,
            current_dataset: None,
            estimated_bytes: 0,
            transferred_bytes: 0,
            start_time: Utc::now(),
            estimated_completion: None,
        }
    }

    pub fn percentage(&self) -> f32 {
        if self.estimated_bytes == 0 {
            return 0.0;
        }
        let ratio = self.transferred_bytes as f32 / self.estimated_bytes as f32;
        (ratio * 100.0).min(100.0)
    }

    /// Refresh byte counts from the live handle
    pub fn sync_from(&mut self, handle: &ProgressHandle) {
        self.transferred_bytes = handle.transferred();
        self.estimated_bytes = handle.estimated();
    }
}
