//! Engine and backends exercised together
//!
//! Most tests drive the coordinator against a scripted `zfs` whose pool
//! lives in a temporary directory.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use holdfast::sync::{
    AsyncStateStore, DatasetStatus, EngineConfig, HoldfastConfig, MemoryBackend, RetentionPolicy,
    RetentionUnit, RunCoordinator, RunState, Target, TracingAlertSink, TransferMode,
    TransportKind, TransportRegistry,
};
use holdfast::transport::{ExecTransport, RemoteShell, StreamTransport, ZfsStore};

use common::{daily, FakePool};

async fn zfs_coordinator(pool: &FakePool, targets: &[Target]) -> Result<RunCoordinator> {
    let config = EngineConfig {
        database_path: pool.database(),
        ..Default::default()
    };
    let state = AsyncStateStore::open(&config.database_path, &config.naming()?).await?;
    let store = ZfsStore::new(RemoteShell::default(), config.owner_property.clone())
        .with_binary(pool.zfs.clone());
    let transports = TransportRegistry::new()
        .with(
            TransportKind::Native,
            Arc::new(StreamTransport::new(store.clone())),
        )
        .with(
            TransportKind::Exec,
            Arc::new(ExecTransport::new(targets, store.clone())),
        );
    Ok(RunCoordinator::new(
        config,
        state,
        Arc::new(store),
        transports,
        Arc::new(TracingAlertSink),
    )?)
}

fn native(target_id: &str, remote: &str, local: &str) -> Target {
    let mut target = Target::new(target_id, remote, local).unwrap();
    target.transport = TransportKind::Native;
    target
}

#[tokio::test]
async fn test_recursive_target_replicates_every_child() -> Result<()> {
    let pool = FakePool::new();
    for dataset in ["src/app", "src/app/logs", "src/app/uploads"] {
        pool.add_dataset(dataset);
        pool.seed(dataset, 0..2);
    }
    let mut target = native("app", "src/app", "backup/app");
    target.recursive = true;
    let coordinator = zfs_coordinator(&pool, &[]).await?;

    let run = coordinator.dispatch(&target).await?;
    assert_eq!(run.state, RunState::Succeeded, "{:?}", run.error_detail);
    let locals: Vec<&str> = run
        .datasets
        .iter()
        .map(|d| d.dataset.local.dataset.as_str())
        .collect();
    assert_eq!(locals, vec!["backup/app", "backup/app/logs", "backup/app/uploads"]);
    for local in locals {
        assert_eq!(pool.names(local), vec![daily(0).name, daily(1).name], "{}", local);
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_child_fails_only_that_dataset() -> Result<()> {
    let pool = FakePool::new();
    pool.add_dataset("src/app");
    pool.add_dataset("src/app/cache");
    pool.seed("src/app", 0..2);
    let mut target = native("app", "src/app", "backup/app");
    target.recursive = true;
    let coordinator = zfs_coordinator(&pool, &[]).await?;

    let run = coordinator.dispatch(&target).await?;
    assert_eq!(run.state, RunState::PartiallySucceeded);
    assert_eq!(run.datasets[0].status, DatasetStatus::Transferred);
    assert_eq!(run.datasets[1].status, DatasetStatus::Failed);
    assert_eq!(run.datasets[1].error_kind.as_deref(), Some("no_remote_history"));
    Ok(())
}

#[tokio::test]
async fn test_retention_destroys_through_zfs() -> Result<()> {
    let pool = FakePool::new();
    pool.seed("src/db", 0..40);
    pool.seed("backup/db", 0..40);
    let mut target = native("db", "src/db", "backup/db");
    target.policy.retention = RetentionPolicy::empty()
        .with(RetentionUnit::Daily, 7)
        .with_extra(25);
    let coordinator = zfs_coordinator(&pool, &[]).await?;

    let run = coordinator.dispatch(&target).await?;
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.datasets[0].pruned.len(), 15);
    let kept = pool.names("backup/db");
    assert_eq!(kept.len(), 25);
    assert_eq!(kept.first(), Some(&daily(15).name));
    assert_eq!(pool.names("src/db").len(), 40);
    Ok(())
}

#[tokio::test]
async fn test_exec_transport_drives_external_program() -> Result<()> {
    let pool = FakePool::new();
    pool.seed("src/vm", 0..3);
    let script = format!(
        r#"[ "$HOLDFAST_DRY_RUN" = 1 ] && {{ echo 512; exit 0; }}
grep "^$HOLDFAST_TO " "{remote}" >> "{local}"
echo 512"#,
        remote = pool.dataset_file("src/vm").display(),
        local = pool.dataset_file("backup/vm").display(),
    );
    let mut target = Target::new("vm", "src/vm", "backup/vm")?;
    target.transport = TransportKind::Exec;
    target.command = Some(vec!["sh".to_string(), "-c".to_string(), script]);
    let coordinator = zfs_coordinator(&pool, std::slice::from_ref(&target)).await?;

    let run = coordinator.dispatch(&target).await?;
    assert_eq!(run.state, RunState::Succeeded, "{:?}", run.error_detail);
    let result = &run.datasets[0];
    assert_eq!(result.mode, Some(TransferMode::Initial));
    assert_eq!(result.follow_ups_completed, 1);
    assert!(run.transferred_bytes >= 512);
    assert_eq!(pool.names("backup/vm"), vec![daily(0).name, daily(2).name]);

    let again = coordinator.dispatch(&target).await?;
    assert_eq!(again.datasets[0].status, DatasetStatus::UpToDate);
    Ok(())
}

#[tokio::test]
async fn test_progress_is_visible_while_transferring() -> Result<()> {
    let backend = MemoryBackend::new();
    let target = Target::new("files", "nas:tank/files", "backup/files")?;
    for n in 0..3 {
        backend.add_snapshot(&target.remote, daily(n));
    }
    backend.set_size_override(Some(4096));
    backend.set_transfer_delay(Some(Duration::from_secs(30)));

    let config = EngineConfig::default();
    let state = AsyncStateStore::open_in_memory(&config.naming()?).await?;
    let coordinator = Arc::new(RunCoordinator::new(
        config,
        state,
        Arc::new(backend.clone()),
        TransportRegistry::new().with(TransportKind::RemoteShell, Arc::new(backend.clone())),
        Arc::new(TracingAlertSink),
    )?);

    let running = {
        let coordinator = coordinator.clone();
        let target = target.clone();
        tokio::spawn(async move { coordinator.dispatch(&target).await })
    };

    let mut seen = None;
    for _ in 0..200 {
        if let Some(progress) = coordinator.progress("files").await {
            if progress.estimated_bytes > 0 {
                seen = Some(progress);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let progress = seen.expect("run never reached transferring");
    assert_eq!(progress.state, RunState::Transferring);
    assert_eq!(
        progress.current_dataset.as_deref(),
        Some("nas:tank/files -> backup/files")
    );
    assert_eq!(progress.estimated_bytes, 4096);
    assert_eq!(progress.transferred_bytes, 0);

    assert!(coordinator.cancel("files").await);
    let run = running.await??;
    assert_eq!(run.state, RunState::Cancelled);
    assert!(coordinator.progress("files").await.is_none());
    Ok(())
}

#[test]
fn test_registry_from_config_file() -> Result<()> {
    let config = HoldfastConfig::from_toml_str(
        r#"
[engine]
snapshot_prefix = "nightly"

[[targets]]
target_id = "vm"
remote = "hv1:vmpool/disk"
local = "tank/vm"
transport = "exec"
command = ["/usr/local/bin/vm-export"]

[[targets]]
target_id = "photos"
remote = "s3-photos/2024"
local = "tank/photos"
transport = "object-storage"
source_url = "s3:photos/2024"
"#,
    )?;
    let registry = holdfast::transport::registry(&config.engine, &config.targets)?;
    assert!(registry.get(TransportKind::Exec).is_ok());
    assert!(registry.remote_store(TransportKind::ObjectStorage).is_some());
    Ok(())
}
