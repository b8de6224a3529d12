//! Transfer execution
//!
//! Drives one [`TransferPlan`] through a [`Transport`]: dry-run sizing,
//! rollback of the local dataset, the bulk transfer and verification.
//! Control operations are bounded by a timeout and never retried here; the
//! bulk transfer has no timeout but stops as soon as the run is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::history::SnapshotStore;
use crate::planner::{TransferMode, TransferPlan};
use crate::progress::ProgressHandle;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes_transferred: u64,
    pub estimated_bytes: u64,
    pub duration: Duration,
}

pub struct TransferExecutor {
    store: Arc<dyn SnapshotStore>,
    transport: Arc<dyn Transport>,
    control_timeout: Duration,
}

impl TransferExecutor {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
        control_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            control_timeout,
        }
    }

    pub async fn execute(
        &self,
        plan: &TransferPlan,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let started = Instant::now();

        let estimated_bytes = self.estimate(plan, cancel).await?;
        progress.add_estimate(estimated_bytes);

        if plan.mode == TransferMode::Incremental && !plan.force_overwrite {
            if let Some(from) = plan.from_name() {
                debug!("Rolling {} back to {}", plan.dataset.local, from);
                control(
                    cancel,
                    self.control_timeout,
                    "local rollback",
                    self.store.rollback(&plan.dataset.local, from),
                )
                .await?;
            }
        }

        info!(
            "Transferring {} ({} bytes estimated, {})",
            plan,
            estimated_bytes,
            plan.wire_mode.as_str()
        );
        let bytes_transferred = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Transfer of {} cancelled", plan.dataset);
                return Err(SyncError::Cancelled);
            }
            result = self.transport.transfer(plan, progress) => result?,
        };

        let present = control(
            cancel,
            self.control_timeout,
            "transfer verification",
            self.transport.verify(plan),
        )
        .await?;
        if !present {
            return Err(SyncError::TransferInterrupted(format!(
                "{} does not hold {} after transfer",
                plan.dataset.local, plan.to.name
            )));
        }

        let duration = started.elapsed();
        info!(
            "Transferred {} bytes into {} in {:?}",
            bytes_transferred, plan.dataset.local, duration
        );
        Ok(TransferReport {
            bytes_transferred,
            estimated_bytes,
            duration,
        })
    }

    async fn estimate(&self, plan: &TransferPlan, cancel: &CancellationToken) -> Result<u64> {
        let estimate = control(
            cancel,
            self.control_timeout,
            "dry-run size estimate",
            self.transport.estimate_size(plan),
        )
        .await;

        match estimate {
            Ok(0) => Err(SyncError::SizeUnavailable(format!(
                "dry run of {} reported zero bytes",
                plan
            ))),
            Ok(bytes) => Ok(bytes),
            Err(SyncError::Timeout(what)) => Err(SyncError::SizeUnavailable(what)),
            Err(
                e @ (SyncError::SizeUnavailable(_)
                | SyncError::Unreachable { .. }
                | SyncError::Cancelled
                | SyncError::Config(_)),
            ) => Err(e),
            Err(other) => Err(SyncError::SizeUnavailable(other.to_string())),
        }
    }
}

/// Abandon `operation` as soon as `cancel` fires
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = operation => result,
    }
}

/// Run a control operation under `limit`, abandoning it on cancellation
pub(crate) async fn control<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellable(cancel, async {
        tokio::time::timeout(limit, operation)
            .await
            .unwrap_or_else(|_| Err(SyncError::Timeout(format!("{} after {:?}", what, limit))))
    })
    .await
}
