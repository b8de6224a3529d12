//! External command transport
//!
//! Hands each transfer to a configured program. The plan is passed through
//! `HOLDFAST_*` environment variables; with `HOLDFAST_DRY_RUN=1` the program
//! must print the estimated stream size as a single integer and move
//! nothing. A real run may print the bytes it moved on its last line.

use std::collections::HashMap;

use async_trait::async_trait;
use holdfast_sync::{
    ProgressHandle, Result, Side, SnapshotStore, SyncError, Target, TransferPlan, Transport,
    TransportKind,
};
use tokio::process::Command;
use tracing::{debug, info};

use crate::command;
use crate::zfs::ZfsStore;

#[derive(Debug, Clone)]
pub struct ExecTransport {
    commands: HashMap<String, Vec<String>>,
    store: ZfsStore,
}

impl ExecTransport {
    /// Commands of every exec target in `targets`
    pub fn new(targets: &[Target], store: ZfsStore) -> Self {
        let commands = targets
            .iter()
            .filter(|t| t.transport == TransportKind::Exec)
            .filter_map(|t| Some((t.target_id.clone(), t.command.clone()?)))
            .filter(|(_, command)| !command.is_empty())
            .collect();
        Self { commands, store }
    }

    fn command(&self, plan: &TransferPlan, dry_run: bool) -> Result<Command> {
        let argv = self.commands.get(&plan.target_id).ok_or_else(|| {
            SyncError::Config(format!("no exec command configured for {}", plan.target_id))
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SyncError::Config(format!("empty exec command for {}", plan.target_id)))?;

        let mut command = Command::new(program);
        command.args(args).envs(environment(plan, dry_run)).kill_on_drop(true);
        Ok(command)
    }
}

/// Environment describing `plan` to the external program
pub fn environment(plan: &TransferPlan, dry_run: bool) -> Vec<(&'static str, String)> {
    vec![
        ("HOLDFAST_TARGET", plan.target_id.clone()),
        ("HOLDFAST_REMOTE_HOST", plan.dataset.remote.host.clone().unwrap_or_default()),
        ("HOLDFAST_SOURCE", plan.dataset.remote.dataset.clone()),
        ("HOLDFAST_DESTINATION", plan.dataset.local.dataset.clone()),
        ("HOLDFAST_MODE", plan.mode.to_string()),
        ("HOLDFAST_FROM", plan.from_name().unwrap_or_default().to_string()),
        ("HOLDFAST_TO", plan.to.name.clone()),
        ("HOLDFAST_WIRE_MODE", plan.wire_mode.as_str().to_string()),
        ("HOLDFAST_FORCE", if plan.force_overwrite { "1" } else { "0" }.to_string()),
        ("HOLDFAST_DRY_RUN", if dry_run { "1" } else { "0" }.to_string()),
    ]
}

/// The integer on the last non-empty line of `stdout`
fn last_integer(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

#[async_trait]
impl Transport for ExecTransport {
    async fn estimate_size(&self, plan: &TransferPlan) -> Result<u64> {
        let output = command::run(self.command(plan, true)?, Side::Remote, "exec dry run").await?;
        if !output.success() {
            return Err(SyncError::SizeUnavailable(format!(
                "dry run of {}: {}",
                plan,
                output.summary()
            )));
        }
        last_integer(&output.stdout).ok_or_else(|| {
            SyncError::SizeUnavailable(format!(
                "dry run of {} printed {:?}, expected an integer",
                plan,
                output.stdout.trim()
            ))
        })
    }

    async fn transfer(&self, plan: &TransferPlan, progress: &ProgressHandle) -> Result<u64> {
        debug!("Handing {} to exec command", plan);
        let output = command::run(self.command(plan, false)?, Side::Remote, "exec transfer").await?;
        if !output.success() {
            return Err(SyncError::TransferInterrupted(format!(
                "{}: {}",
                plan,
                output.summary()
            )));
        }
        let bytes = last_integer(&output.stdout).unwrap_or(0);
        progress.add(bytes);
        info!("Exec command finished {} ({} bytes reported)", plan, bytes);
        Ok(bytes)
    }

    async fn verify(&self, plan: &TransferPlan) -> Result<bool> {
        let snapshots = self.store.list_snapshots(&plan.dataset.local).await?;
        Ok(snapshots.iter().any(|s| s.name == plan.to.name))
    }
}
