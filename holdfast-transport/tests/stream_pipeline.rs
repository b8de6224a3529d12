//! End-to-end runs against a scripted `zfs` that keeps its pool in files

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use holdfast_sync::{
    AsyncStateStore, DatasetStatus, EngineConfig, RunCoordinator, RunState, SnapshotNaming,
    Target, TracingAlertSink, TransferMode, TransportKind, TransportRegistry,
};
use holdfast_transport::{RemoteShell, StreamTransport, ZfsStore};
use tempfile::TempDir;

const FAKE_ZFS: &str = r#"#!/bin/sh
state="__STATE__"
file() { echo "$state/$(echo "$1" | tr '/' '_')"; }
for last; do :; done
cmd="$1"; shift
case "$cmd" in
  list)
    case "$*" in
      *snapshot*)
        f=$(file "$last")
        if [ ! -f "$f" ]; then
          echo "cannot open '$last': dataset does not exist" >&2
          exit 1
        fi
        while read -r name epoch; do
          printf '%s@%s\t%s\t-\n' "$last" "$name" "$epoch"
        done < "$f"
        ;;
      *) echo "$last" ;;
    esac
    ;;
  send)
    dry=0; from=""
    while [ $# -gt 1 ]; do
      case "$1" in
        -n) dry=1 ;;
        -I) shift; from="${1#@}" ;;
      esac
      shift
    done
    ds="${1%@*}"; to="${1#*@}"; f=$(file "$ds")
    if [ -z "$from" ]; then
      lines=$(grep "^$to " "$f")
    else
      lines=$(awk -v from="$from" -v to="$to" 'p{print} $1==from{p=1} $1==to{exit}' "$f")
    fi
    if [ "$dry" = 1 ]; then
      printf 'size\t%d\n' $(( $(echo "$lines" | wc -l) * 100 ))
    else
      echo "$lines"
    fi
    ;;
  receive)
    f=$(file "$last")
    if [ -f "$state/slow" ]; then
      touch "$state/receiving"
      sleep 1
      touch "$state/received"
    fi
    cat >> "$f"
    ;;
  destroy)
    ds="${last%@*}"; snap="${last#*@}"; f=$(file "$ds")
    grep -v "^$snap " "$f" > "$f.tmp"; mv "$f.tmp" "$f"
    ;;
  rollback) ;;
  *) echo "unsupported: $cmd" >&2; exit 2 ;;
esac
"#;

struct Pool {
    _dir: TempDir,
    state: PathBuf,
    zfs: String,
    db: PathBuf,
}

fn pool() -> Pool {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("pool");
    std::fs::create_dir(&state).unwrap();
    let zfs = dir.path().join("zfs");
    std::fs::write(&zfs, FAKE_ZFS.replace("__STATE__", &state.to_string_lossy())).unwrap();
    std::fs::set_permissions(&zfs, std::fs::Permissions::from_mode(0o755)).unwrap();
    let db = dir.path().join("holdfast.db");
    Pool {
        state,
        zfs: zfs.to_string_lossy().into_owned(),
        db,
        _dir: dir,
    }
}

fn dataset_file(state: &Path, dataset: &str) -> PathBuf {
    state.join(dataset.replace('/', "_"))
}

fn seed(state: &Path, dataset: &str, days: std::ops::Range<i64>) {
    let naming = SnapshotNaming::default();
    let base = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    let mut lines = String::new();
    for n in days {
        let at = base + Duration::days(n);
        lines.push_str(&format!("{} {}\n", naming.format(at), at.timestamp()));
    }
    let path = dataset_file(state, dataset);
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    std::fs::write(path, existing + &lines).unwrap();
}

fn lines(state: &Path, dataset: &str) -> usize {
    std::fs::read_to_string(dataset_file(state, dataset))
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

async fn coordinator(pool: &Pool) -> RunCoordinator {
    let config = EngineConfig {
        database_path: pool.db.clone(),
        ..Default::default()
    };
    let state = AsyncStateStore::open(&config.database_path, &config.naming().unwrap())
        .await
        .unwrap();
    let store = ZfsStore::new(RemoteShell::default(), config.owner_property.clone())
        .with_binary(pool.zfs.clone());
    let transports = TransportRegistry::new().with(
        TransportKind::Native,
        Arc::new(StreamTransport::new(store.clone())),
    );
    RunCoordinator::new(
        config,
        state,
        Arc::new(store),
        transports,
        Arc::new(TracingAlertSink),
    )
    .unwrap()
}

fn target() -> Target {
    let mut target = Target::new("db", "src/db", "backup/db").unwrap();
    target.transport = TransportKind::Native;
    target
}

#[tokio::test]
async fn test_initial_then_incremental_through_zfs() {
    let pool = pool();
    seed(&pool.state, "src/db", 0..3);
    let coordinator = coordinator(&pool).await;

    let run = coordinator.dispatch(&target()).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded, "{:?}", run.error_detail);
    let result = &run.datasets[0];
    assert_eq!(result.mode, Some(TransferMode::Initial));
    assert_eq!(result.follow_ups_completed, 1);
    assert_eq!(lines(&pool.state, "backup/db"), 3);
    assert_eq!(result.estimated_bytes, 300);

    seed(&pool.state, "src/db", 3..5);
    let run = coordinator.dispatch(&target()).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded, "{:?}", run.error_detail);
    assert_eq!(run.datasets[0].mode, Some(TransferMode::Incremental));
    assert_eq!(lines(&pool.state, "backup/db"), 5);

    let run = coordinator.dispatch(&target()).await.unwrap();
    assert_eq!(run.datasets[0].status, DatasetStatus::UpToDate);
}

#[tokio::test]
async fn test_missing_source_fails_run() {
    let pool = pool();
    let coordinator = coordinator(&pool).await;

    let run = coordinator.dispatch(&target()).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error_kind.as_deref(), Some("no_remote_history"));
}

#[tokio::test]
async fn test_cancel_kills_receiving_process() {
    let pool = pool();
    seed(&pool.state, "src/db", 0..1);
    std::fs::write(pool.state.join("slow"), "").unwrap();
    let coordinator = Arc::new(coordinator(&pool).await);

    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.dispatch(&target()).await })
    };

    let receiving = pool.state.join("receiving");
    for _ in 0..500 {
        if receiving.exists() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(receiving.exists(), "zfs receive never started");

    assert!(coordinator.cancel("db").await);
    let run = running.await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Cancelled);

    // A surviving receive would finish its sleep and get this far.
    tokio::time::sleep(StdDuration::from_millis(1500)).await;
    assert!(!pool.state.join("received").exists());
    assert_eq!(lines(&pool.state, "backup/db"), 0);
}
