//! Run outcome notifications

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::run::RunState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Alert {
    /// Sent once for every run that reached a terminal state
    RunFinished {
        target_id: String,
        run_id: String,
        outcome: RunState,
        duration: Duration,
        transferred_bytes: u64,
        error: Option<String>,
        /// Start of the failure streak this success ended
        recovered_since: Option<DateTime<Utc>>,
    },
    /// The target failed `consecutive_failures` times in a row
    PersistentFailure {
        target_id: String,
        consecutive_failures: u32,
        first_fail: Option<DateTime<Utc>>,
        last_error: Option<String>,
    },
    /// Follow-up incrementals after an initial transfer did not finish;
    /// the replica lags and the remote may prune its ancestor
    CatchUpIncomplete {
        target_id: String,
        dataset: String,
        remaining: usize,
        detail: String,
    },
}

impl Alert {
    pub fn target_id(&self) -> &str {
        match self {
            Alert::RunFinished { target_id, .. }
            | Alert::PersistentFailure { target_id, .. }
            | Alert::CatchUpIncomplete { target_id, .. } => target_id,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: &Alert) {
        match alert {
            Alert::RunFinished {
                target_id,
                outcome,
                duration,
                transferred_bytes,
                error: None,
                recovered_since,
                ..
            } => {
                if let Some(since) = recovered_since {
                    info!(
                        "{}: recovered after failing since {} ({} bytes in {:?})",
                        target_id, since, transferred_bytes, duration
                    );
                } else {
                    info!(
                        "{}: run {} ({} bytes in {:?})",
                        target_id, outcome, transferred_bytes, duration
                    );
                }
            }
            Alert::RunFinished {
                target_id,
                outcome,
                error: Some(error),
                ..
            } => warn!("{}: run {}: {}", target_id, outcome, error),
            Alert::PersistentFailure {
                target_id,
                consecutive_failures,
                first_fail,
                last_error,
            } => error!(
                "{}: {} consecutive failures since {}: {}",
                target_id,
                consecutive_failures,
                first_fail.map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339()),
                last_error.as_deref().unwrap_or("no error recorded")
            ),
            Alert::CatchUpIncomplete {
                target_id,
                dataset,
                remaining,
                detail,
            } => error!(
                "{}: {} still {} snapshots behind after initial transfer: {}",
                target_id, dataset, remaining, detail
            ),
        }
    }
}

/// Forwards alerts to a channel
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    sender: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn notify(&self, alert: &Alert) {
        if self.sender.send(alert.clone()).is_err() {
            warn!("Alert receiver dropped, discarding alert for {}", alert.target_id());
        }
    }
}
