//! Snapshot stream transport
//!
//! Pipes `zfs send` on the source into `zfs receive` on the local side,
//! counting bytes as they pass. The source runs behind `ssh` when the remote
//! endpoint names a host (remote-shell) and directly otherwise (native).
//! Incrementals use `-I` so intermediate snapshots arrive with the stream.

use std::process::Stdio;

use async_trait::async_trait;
use holdfast_sync::{
    ProgressHandle, Result, Side, SnapshotStore, SyncError, TransferMode, TransferPlan, Transport,
    WireMode,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::command::{self, is_broken_pipe, is_connect_failure, stderr_summary, trim_output};
use crate::zfs::ZfsStore;

const COPY_BUFFER: usize = 256 * 1024;

/// Receive errors meaning the destination is in the way rather than broken
const BUSY_MARKERS: [&str; 4] = [
    "exists",
    "has been modified",
    "dataset is busy",
    "destination has snapshots",
];

#[derive(Debug, Clone)]
pub struct StreamTransport {
    store: ZfsStore,
}

impl StreamTransport {
    pub fn new(store: ZfsStore) -> Self {
        Self { store }
    }

    fn send_args(plan: &TransferPlan, dry_run: bool) -> Vec<String> {
        let mut args = vec!["send".to_string()];
        if dry_run {
            args.extend(["-n".to_string(), "-P".to_string()]);
        }
        match plan.wire_mode {
            WireMode::Plain => {}
            WireMode::Compressed => args.push("-c".to_string()),
            WireMode::Raw => args.push("-w".to_string()),
        }
        if let (TransferMode::Incremental, Some(from)) = (plan.mode, plan.from_name()) {
            args.push("-I".to_string());
            args.push(format!("@{}", from));
        }
        args.push(format!("{}@{}", plan.dataset.remote.dataset, plan.to.name));
        args
    }

    fn receive_args(plan: &TransferPlan) -> Vec<String> {
        let mut args = vec!["receive".to_string(), "-u".to_string()];
        if plan.force_overwrite {
            args.push("-F".to_string());
        }
        args.push(plan.dataset.local.dataset.clone());
        args
    }

    fn send_command(&self, plan: &TransferPlan, dry_run: bool) -> Command {
        self.store.shell().command(
            &plan.dataset.remote,
            self.store.binary(),
            &Self::send_args(plan, dry_run),
        )
    }

    fn receive_command(&self, plan: &TransferPlan) -> Command {
        self.store.shell().command(
            &plan.dataset.local,
            self.store.binary(),
            &Self::receive_args(plan),
        )
    }

    fn receive_failure(plan: &TransferPlan, stderr: &str) -> SyncError {
        let summary = stderr_summary(stderr).unwrap_or_else(|| "receive failed".to_string());
        if BUSY_MARKERS.iter().any(|marker| summary.contains(marker)) {
            SyncError::DestinationBusy(format!("{}: {}", plan.dataset.local, summary))
        } else {
            SyncError::TransferInterrupted(format!("receive into {}: {}", plan.dataset.local, summary))
        }
    }
}

/// Bytes of the `size` line printed by `zfs send -n -P`
pub fn parse_dry_run_size(output: &str) -> Option<u64> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some("size"), Some(bytes), None) => bytes.parse().ok(),
                _ => None,
            }
        })
        .last()
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        // A read error only loses diagnostics.
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

#[async_trait]
impl Transport for StreamTransport {
    async fn estimate_size(&self, plan: &TransferPlan) -> Result<u64> {
        let output = command::run(self.send_command(plan, true), Side::Remote, "zfs send -n").await?;
        if !output.success() {
            if is_connect_failure(&plan.dataset.remote, &output.status) {
                return Err(SyncError::unreachable(Side::Remote, output.summary()));
            }
            return Err(SyncError::SizeUnavailable(format!(
                "dry run of {}: {}",
                plan,
                output.summary()
            )));
        }
        // Older releases print the estimate on stderr.
        parse_dry_run_size(&output.stdout)
            .or_else(|| parse_dry_run_size(&output.stderr))
            .ok_or_else(|| {
                SyncError::SizeUnavailable(format!("no size in dry run output of {}", plan))
            })
    }

    async fn transfer(&self, plan: &TransferPlan, progress: &ProgressHandle) -> Result<u64> {
        let mut send = self.send_command(plan, false);
        send.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut receive = self.receive_command(plan);
        receive
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut sender = send.spawn().map_err(|e| {
            SyncError::unreachable(Side::Remote, format!("cannot start zfs send: {}", e))
        })?;
        let mut receiver = receive.spawn().map_err(|e| {
            SyncError::unreachable(Side::Local, format!("cannot start zfs receive: {}", e))
        })?;

        let mut source = sender
            .stdout
            .take()
            .ok_or_else(|| SyncError::Internal("zfs send has no stdout".to_string()))?;
        let mut sink = receiver
            .stdin
            .take()
            .ok_or_else(|| SyncError::Internal("zfs receive has no stdin".to_string()))?;
        let send_stderr = sender.stderr.take();
        let receive_stderr = receiver.stderr.take();

        debug!("Streaming {}", plan);
        let copy = async move {
            let mut buf = vec![0u8; COPY_BUFFER];
            let mut total = 0u64;
            loop {
                let n = source.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n]).await?;
                total += n as u64;
                progress.add(n as u64);
            }
            sink.shutdown().await?;
            Ok::<u64, std::io::Error>(total)
        };
        let (copied, send_stderr, receive_stderr) =
            tokio::join!(copy, drain(send_stderr), drain(receive_stderr));

        let send_status = sender.wait().await?;
        let receive_status = receiver.wait().await?;
        let send_stderr = trim_output(&send_stderr);
        let receive_stderr = trim_output(&receive_stderr);

        // A receiver that gave up closes the pipe under the sender.
        if !receive_status.success() && (send_status.success() || is_broken_pipe(&send_status)) {
            return Err(Self::receive_failure(plan, &receive_stderr));
        }
        if !send_status.success() {
            let summary = stderr_summary(&send_stderr).unwrap_or_else(|| send_status.to_string());
            if is_connect_failure(&plan.dataset.remote, &send_status) {
                return Err(SyncError::unreachable(Side::Remote, summary));
            }
            return Err(SyncError::TransferInterrupted(format!(
                "send of {}: {}",
                plan.dataset.remote, summary
            )));
        }
        if !receive_status.success() {
            return Err(Self::receive_failure(plan, &receive_stderr));
        }
        let bytes = copied.map_err(|e| {
            SyncError::TransferInterrupted(format!("stream of {} broke: {}", plan.dataset, e))
        })?;

        info!("Received {} bytes into {}", bytes, plan.dataset.local);
        Ok(bytes)
    }

    async fn verify(&self, plan: &TransferPlan) -> Result<bool> {
        let snapshots = self.store.list_snapshots(&plan.dataset.local).await?;
        Ok(snapshots.iter().any(|s| s.name == plan.to.name))
    }
}
