//! Integration tests for the replication engine

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use holdfast_sync::{
    Alert, AsyncStateStore, ChannelAlertSink, DatasetStatus, EngineConfig, Endpoint,
    FileConfigStore, MemoryBackend, RecoverySweep, RetentionPolicy, RetentionUnit, Run,
    RunCoordinator, RunState, Snapshot, SnapshotNaming, StateStore, SyncError, Target,
    TargetPolicy, TransferMode, TransportKind, TransportRegistry,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn daily(n: i64) -> Snapshot {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap() + ChronoDuration::days(n);
    Snapshot::new(SnapshotNaming::default().format(at), at)
}

fn engine(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        database_path: dir.path().join("holdfast.db"),
        ..Default::default()
    }
}

async fn coordinator(
    config: EngineConfig,
    backend: &MemoryBackend,
) -> (RunCoordinator, UnboundedReceiver<Alert>) {
    let state = AsyncStateStore::open(&config.database_path, &config.naming().unwrap())
        .await
        .unwrap();
    let (sink, alerts) = ChannelAlertSink::new();
    let transports =
        TransportRegistry::new().with(TransportKind::RemoteShell, Arc::new(backend.clone()));
    let coordinator = RunCoordinator::new(
        config,
        state,
        Arc::new(backend.clone()),
        transports,
        Arc::new(sink),
    )
    .unwrap();
    (coordinator, alerts)
}

fn target() -> Target {
    Target::new("files", "nas:tank/files", "backup/files").unwrap()
}

#[tokio::test]
async fn test_run_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let target = target();
    for n in 0..3 {
        backend.add_snapshot(&target.remote, daily(n));
    }

    let run_id = {
        let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;
        coordinator.dispatch(&target).await.unwrap().run_id
    };

    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;
    let stored = coordinator.state().run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Succeeded);
    assert_eq!(stored.datasets[0].mode, Some(TransferMode::Initial));
    assert!(coordinator.state().lock("files").await.unwrap().is_none());

    let second = coordinator.dispatch(&target).await.unwrap();
    assert_eq!(second.datasets[0].status, DatasetStatus::UpToDate);
    let recent = coordinator.state().recent_runs("files", 10).await.unwrap();
    assert_eq!(recent.len(), 2);
}

#[test]
fn test_store_rejects_other_naming_scheme() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("holdfast.db");
    StateStore::open(&path, &SnapshotNaming::default()).unwrap();

    let other = SnapshotNaming::new("zrepl").unwrap();
    let err = StateStore::open(&path, &other).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test]
async fn test_stale_lock_blocks_until_swept() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let target = target();
    backend.add_snapshot(&target.remote, daily(0));
    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;

    let mut crashed = Run::new("files");
    crashed.transition(RunState::Locked).unwrap();
    let state = coordinator.state();
    state.insert_run(&crashed).await.unwrap();
    state
        .try_acquire_lock(
            "files",
            &crashed.run_id,
            "old-host:1234",
            Utc::now() - ChronoDuration::hours(2),
        )
        .await
        .unwrap();

    let err = coordinator.dispatch(&target).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning(_)));

    let stats = RecoverySweep::new(state.clone(), Duration::from_secs(600))
        .sweep(Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.runs_abandoned, 1);

    let run = coordinator.dispatch(&target).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.retry_count, 1);
}

#[tokio::test]
async fn test_forced_overwrite_discards_local_divergence() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let mut target = target();
    target.policy.force_overwrite = true;
    for n in 0..4 {
        backend.add_snapshot(&target.remote, daily(n));
    }
    backend.add_snapshot(&target.local, daily(0));
    backend.add_snapshot(&target.local, daily(1));
    let stray = Snapshot::new(
        "holdfast-20240302T1200Z",
        Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap(),
    );
    backend.add_snapshot(&target.local, stray.clone());

    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;
    let run = coordinator.dispatch(&target).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    let names = backend.names(&target.local);
    assert!(!names.contains(&stray.name));
    assert!(names.contains(&daily(3).name));
    assert!(backend.rollbacks().is_empty());
}

#[tokio::test]
async fn test_bounded_catch_up_across_runs() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let mut target = target();
    target.policy.max_snapshots_per_run = 4;
    for n in 0..20 {
        backend.add_snapshot(&target.remote, daily(n));
    }
    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;

    let first = coordinator.dispatch(&target).await.unwrap();
    assert_eq!(first.datasets[0].follow_ups_completed, 2);
    assert_eq!(first.datasets[0].to.as_deref(), Some(daily(6).name.as_str()));
    assert_eq!(first.datasets[0].remaining, 13);

    let mut remaining = Vec::new();
    loop {
        let run = coordinator.dispatch(&target).await.unwrap();
        assert!(run.is_success());
        if run.datasets[0].status == DatasetStatus::UpToDate {
            break;
        }
        remaining.push(run.datasets[0].remaining);
    }
    assert_eq!(remaining, vec![10, 7, 4, 1, 0]);
    assert_eq!(backend.names(&target.local).len(), 20);
}

#[tokio::test]
async fn test_pruning_forty_dailies() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let mut target = target();
    target.policy.retention = RetentionPolicy::empty()
        .with(RetentionUnit::Daily, 7)
        .with_extra(25);
    for n in 0..40 {
        backend.add_snapshot(&target.remote, daily(n));
        backend.add_snapshot(&target.local, daily(n));
    }
    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;

    let run = coordinator.dispatch(&target).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    let result = &run.datasets[0];
    assert_eq!(result.status, DatasetStatus::UpToDate);
    assert_eq!(result.pruned.len(), 15);
    assert_eq!(result.pruned.first(), Some(&daily(0).name));

    let kept = backend.names(&target.local);
    assert_eq!(kept.len(), 25);
    assert!(kept.contains(&daily(39).name));
}

#[tokio::test]
async fn test_prune_failure_does_not_fail_run() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let mut target = target();
    target.policy.retention = RetentionPolicy::empty().with_extra(2);
    for n in 0..5 {
        backend.add_snapshot(&target.remote, daily(n));
        backend.add_snapshot(&target.local, daily(n));
    }
    backend.fail_destroy(&daily(1).name);
    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;

    let run = coordinator.dispatch(&target).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    let result = &run.datasets[0];
    assert_eq!(result.pruned, vec![daily(0).name, daily(2).name]);
    assert_eq!(result.prune_failures.len(), 1);
}

#[tokio::test]
async fn test_dispatch_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[[targets]]
target_id = "mail"
remote = "mx1:rpool/mail"
local = "backup/mail"

[targets.policy]
retention = "7d"
max_snapshots_per_run = 3

[[targets]]
target_id = "scratch"
remote = "mx1:rpool/scratch"
local = "backup/scratch"
enabled = false
"#,
    )
    .unwrap();

    let backend = MemoryBackend::new();
    backend.add_snapshot(&Endpoint::remote("mx1", "rpool/mail"), daily(0));
    let (coordinator, _alerts) = coordinator(engine(&dir), &backend).await;
    let results = coordinator
        .dispatch_configured(&FileConfigStore::new(&path))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let (target_id, run) = &results[0];
    assert_eq!(target_id, "mail");
    assert!(run.as_ref().unwrap().is_success());
    assert_eq!(backend.names(&Endpoint::local("backup/mail")), vec![daily(0).name]);
}

#[tokio::test]
async fn test_no_remote_history_escalates() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let target = target();
    backend.create_dataset(&target.remote);
    let config = EngineConfig {
        persistent_failure_threshold: 2,
        ..engine(&dir)
    };
    let (coordinator, mut alerts) = coordinator(config, &backend).await;

    for _ in 0..2 {
        let run = coordinator.dispatch(&target).await.unwrap();
        assert_eq!(run.error_kind.as_deref(), Some("no_remote_history"));
    }
    let mut escalations = 0;
    while let Ok(alert) = alerts.try_recv() {
        if let Alert::PersistentFailure {
            consecutive_failures,
            ..
        } = alert
        {
            assert_eq!(consecutive_failures, 2);
            escalations += 1;
        }
    }
    assert_eq!(escalations, 1);
}

#[test]
fn test_policy_default_is_usable() {
    let policy = TargetPolicy::default();
    assert!(policy.validate().is_ok());
    assert_eq!(policy.retention.to_string(), "1y,6m,3w,15d (+25 extra)");
}
