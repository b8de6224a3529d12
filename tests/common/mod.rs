//! Shared fixtures for workspace tests

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use chrono::{Duration, TimeZone, Utc};
use holdfast::sync::{Snapshot, SnapshotNaming};
use tempfile::TempDir;

/// A `zfs` stand-in keeping one file per dataset, one `name epoch` line per
/// snapshot. `datasets` lists the filesystems for recursive listings.
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
          if [ -n "$name" ]; then
            printf '%s@%s\t%s\t-\n' "$last" "$name" "$epoch"
          fi
        done < "$f"
        ;;
      *)
        grep -E "^$last(/|\$)" "$state/datasets" 2>/dev/null || echo "$last"
        ;;
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

pub struct FakePool {
    _dir: TempDir,
    pub root: PathBuf,
    pub state: PathBuf,
    pub zfs: String,
}

impl FakePool {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("pool");
        std::fs::create_dir(&state).unwrap();
        let zfs = dir.path().join("zfs");
        std::fs::write(&zfs, FAKE_ZFS.replace("__STATE__", &state.to_string_lossy())).unwrap();
        std::fs::set_permissions(&zfs, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            root: dir.path().to_path_buf(),
            state,
            zfs: zfs.to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("holdfast.db")
    }

    pub fn dataset_file(&self, dataset: &str) -> PathBuf {
        self.state.join(dataset.replace('/', "_"))
    }

    /// Register `dataset` for recursive listings
    pub fn add_dataset(&self, dataset: &str) {
        let path = self.state.join("datasets");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        std::fs::write(path, format!("{}{}\n", existing, dataset)).unwrap();
    }

    /// Append daily snapshots `days` to `dataset`
    pub fn seed(&self, dataset: &str, days: std::ops::Range<i64>) {
        let mut lines = String::new();
        for n in days {
            let snapshot = daily(n);
            lines.push_str(&format!(
                "{} {}\n",
                snapshot.name,
                snapshot.created_at.timestamp()
            ));
        }
        let path = self.dataset_file(dataset);
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        std::fs::write(path, existing + &lines).unwrap();
    }

    pub fn names(&self, dataset: &str) -> Vec<String> {
        std::fs::read_to_string(self.dataset_file(dataset))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }
}

pub fn daily(n: i64) -> Snapshot {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap() + Duration::days(n);
    Snapshot::new(SnapshotNaming::default().format(at), at)
}
