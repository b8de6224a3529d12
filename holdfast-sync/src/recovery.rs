//! Recovery of runs abandoned by a crashed process
//!
//! A lock whose heartbeat is older than the stale timeout belongs to a
//! process that died mid-run. The sweep releases it and closes the run as
//! failed. It is only ever invoked explicitly, never from inside a run.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::errors::{Result, SyncError};
use crate::state::{AsyncStateStore, LockRecord};

#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub locks_inspected: usize,
    pub locks_released: usize,
    pub runs_abandoned: usize,
    pub total_recovery_time: Duration,
}

pub struct RecoverySweep {
    state: AsyncStateStore,
    stale_after: Duration,
}

impl RecoverySweep {
    pub fn new(state: AsyncStateStore, stale_after: Duration) -> Self {
        Self { state, stale_after }
    }

    pub fn is_stale(&self, lock: &LockRecord, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(lock.heartbeat_at);
        age.to_std().map_or(false, |age| age > self.stale_after)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RecoveryStats> {
        let started = Instant::now();
        let locks = self.state.locks().await?;
        let mut stats = RecoveryStats {
            locks_inspected: locks.len(),
            ..Default::default()
        };

        for lock in locks.into_iter().filter(|l| self.is_stale(l, now)) {
            warn!(
                "Releasing stale lock on {} held by {} (run {}, last heartbeat {})",
                lock.target_id, lock.holder, lock.run_id, lock.heartbeat_at
            );
            if !self.state.release_lock(&lock.target_id, &lock.run_id).await? {
                continue;
            }
            stats.locks_released += 1;

            let Some(mut run) = self.state.run(&lock.run_id).await? else {
                continue;
            };
            if run.state.is_terminal() {
                continue;
            }
            run.fail(&SyncError::Internal(format!(
                "abandoned: no heartbeat from {} since {}",
                lock.holder, lock.heartbeat_at
            )))?;
            run.end_time = Some(now);
            self.state.finish_run(&run).await?;
            self.state
                .record_outcome(&run.target_id, run.state, now)
                .await?;
            stats.runs_abandoned += 1;
        }

        stats.total_recovery_time = started.elapsed();
        info!(
            "Recovery sweep: {} locks inspected, {} released, {} runs abandoned in {:?}",
            stats.locks_inspected,
            stats.locks_released,
            stats.runs_abandoned,
            stats.total_recovery_time
        );
        Ok(stats)
    }
}
