//! Persistent engine state
//!
//! One SQLite database shared by every process driving the same backup
//! store. It holds the per-target locks, the run history, per-target health
//! and the naming scheme the store was created with.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::naming::SnapshotNaming;
use crate::run::{Run, RunState};

/// A held per-target lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub target_id: String,
    pub run_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// `dataset@snapshot` entries in use by the run
    pub pinned: Vec<String>,
}

/// Failure streak and last outcomes of a target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub target_id: String,
    pub consecutive_failures: u32,
    pub first_fail: Option<DateTime<Utc>>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

impl TargetHealth {
    fn new(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            ..Default::default()
        }
    }

    /// Apply one terminal outcome
    pub fn record(&mut self, outcome: RunState, at: DateTime<Utc>) {
        match outcome {
            RunState::Failed | RunState::PartiallySucceeded => {
                self.consecutive_failures += 1;
                self.first_fail.get_or_insert(at);
            }
            RunState::Succeeded => {
                self.consecutive_failures = 0;
                self.first_fail = None;
                self.last_ok = Some(at);
            }
            _ => {}
        }
        self.last_run = Some(at);
    }
}

pub fn pin_key(dataset: &str, snapshot: &str) -> String {
    format!("{}@{}", dataset, snapshot)
}

fn to_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn from_text(index: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn from_optional_text(index: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| from_text(index, v)).transpose()
}

fn lock_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockRecord> {
    let pinned: String = row.get(5)?;
    Ok(LockRecord {
        target_id: row.get(0)?,
        run_id: row.get(1)?,
        holder: row.get(2)?,
        acquired_at: from_text(3, row.get(3)?)?,
        heartbeat_at: from_text(4, row.get(4)?)?,
        pinned: serde_json::from_str(&pinned).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

const LOCK_COLUMNS: &str = "target_id, run_id, holder, acquired_at, heartbeat_at, pinned";

/// Synchronous store over one connection
#[derive(Debug)]
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>, naming: &SnapshotNaming) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, naming)
    }

    pub fn open_in_memory(naming: &SnapshotNaming) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, naming)
    }

    fn with_connection(conn: Connection, naming: &SnapshotNaming) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("State store journal mode: {}", mode);
        let store = Self { conn };
        store.initialize()?;
        store.check_naming_scheme(naming)?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS target_locks (
                target_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL,
                pinned TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                state TEXT NOT NULL,
                transferred_bytes INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                error_detail TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                detail TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS target_health (
                target_id TEXT PRIMARY KEY,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                first_fail TEXT,
                last_ok TEXT,
                last_run TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id, start_time DESC);
            "#,
        )?;
        Ok(())
    }

    /// Record the naming scheme on first use, refuse a different one later
    fn check_naming_scheme(&self, naming: &SnapshotNaming) -> Result<()> {
        let scheme = naming.scheme_id();
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'naming_scheme'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(existing) if existing == scheme => Ok(()),
            Some(existing) => Err(SyncError::Config(format!(
                "state store uses naming scheme {}, configured {}; migrate existing snapshots first",
                existing, scheme
            ))),
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('naming_scheme', ?1)",
                    params![scheme],
                )?;
                info!("State store initialized with naming scheme {}", scheme);
                Ok(())
            }
        }
    }

    /// Atomic test-and-set; `false` when another run holds the lock
    pub fn try_acquire_lock(
        &self,
        target_id: &str,
        run_id: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO target_locks (target_id, run_id, holder, acquired_at, heartbeat_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(target_id) DO NOTHING
            "#,
            params![target_id, run_id, holder, to_text(now)],
        )?;
        Ok(inserted == 1)
    }

    /// `false` when the lock is no longer held by `run_id`
    pub fn heartbeat(&self, target_id: &str, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE target_locks SET heartbeat_at = ?3 WHERE target_id = ?1 AND run_id = ?2",
            params![target_id, run_id, to_text(now)],
        )?;
        Ok(updated == 1)
    }

    pub fn pin_snapshots(&self, target_id: &str, run_id: &str, pinned: &[String]) -> Result<()> {
        self.conn.execute(
            "UPDATE target_locks SET pinned = ?3 WHERE target_id = ?1 AND run_id = ?2",
            params![target_id, run_id, serde_json::to_string(pinned)?],
        )?;
        Ok(())
    }

    pub fn release_lock(&self, target_id: &str, run_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM target_locks WHERE target_id = ?1 AND run_id = ?2",
            params![target_id, run_id],
        )?;
        Ok(deleted == 1)
    }

    pub fn lock(&self, target_id: &str) -> Result<Option<LockRecord>> {
        let sql = format!("SELECT {} FROM target_locks WHERE target_id = ?1", LOCK_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![target_id], lock_from_row)
            .optional()?)
    }

    pub fn locks(&self) -> Result<Vec<LockRecord>> {
        let sql = format!("SELECT {} FROM target_locks ORDER BY target_id", LOCK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], lock_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Snapshots of `dataset` pinned by any live lock
    pub fn pinned_for(&self, dataset: &str) -> Result<HashSet<String>> {
        let prefix = format!("{}@", dataset);
        Ok(self
            .locks()?
            .into_iter()
            .flat_map(|lock| lock.pinned)
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO runs (run_id, target_id, start_time, end_time, state,
                              transferred_bytes, error_kind, error_detail, retry_count, detail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                run.run_id,
                run.target_id,
                to_text(run.start_time),
                run.end_time.map(to_text),
                run.state.as_str(),
                run.transferred_bytes as i64,
                run.error_kind,
                run.error_detail,
                run.retry_count,
                serde_json::to_string(run)?,
            ],
        )?;
        Ok(())
    }

    /// Write the final form of a run; terminal rows are never rewritten
    pub fn finish_run(&self, run: &Run) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE runs SET end_time = ?2, state = ?3, transferred_bytes = ?4,
                            error_kind = ?5, error_detail = ?6, detail = ?7
            WHERE run_id = ?1 AND end_time IS NULL
            "#,
            params![
                run.run_id,
                run.end_time.map(to_text),
                run.state.as_str(),
                run.transferred_bytes as i64,
                run.error_kind,
                run.error_detail,
                serde_json::to_string(run)?,
            ],
        )?;
        if updated == 0 {
            warn!("Run {} was already finished, keeping the first record", run.run_id);
        }
        Ok(())
    }

    pub fn run(&self, run_id: &str) -> Result<Option<Run>> {
        let detail: Option<String> = self
            .conn
            .query_row(
                "SELECT detail FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        detail
            .map(|d| serde_json::from_str(&d).map_err(SyncError::from))
            .transpose()
    }

    /// Newest first
    pub fn recent_runs(&self, target_id: &str, limit: usize) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT detail FROM runs WHERE target_id = ?1 ORDER BY start_time DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![target_id, limit as i64], |row| row.get::<_, String>(0))?;
        let mut runs = Vec::new();
        for detail in rows {
            runs.push(serde_json::from_str(&detail?)?);
        }
        Ok(runs)
    }

    /// Mean duration of the last `window` runs that moved data successfully
    pub fn average_duration(&self, target_id: &str, window: usize) -> Result<Option<Duration>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT start_time, end_time FROM runs
            WHERE target_id = ?1 AND end_time IS NOT NULL
              AND state IN ('succeeded', 'partially_succeeded')
            ORDER BY start_time DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![target_id, window as i64], |row| {
            Ok((from_text(0, row.get(0)?)?, from_text(1, row.get(1)?)?))
        })?;

        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for row in rows {
            let (start, end) = row?;
            total += (end - start).to_std().unwrap_or_default();
            count += 1;
        }
        Ok((count > 0).then(|| total / count))
    }

    pub fn health(&self, target_id: &str) -> Result<TargetHealth> {
        let health = self
            .conn
            .query_row(
                r#"
                SELECT consecutive_failures, first_fail, last_ok, last_run
                FROM target_health WHERE target_id = ?1
                "#,
                params![target_id],
                |row| {
                    Ok(TargetHealth {
                        target_id: target_id.to_string(),
                        consecutive_failures: row.get(0)?,
                        first_fail: from_optional_text(1, row.get(1)?)?,
                        last_ok: from_optional_text(2, row.get(2)?)?,
                        last_run: from_optional_text(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(health.unwrap_or_else(|| TargetHealth::new(target_id)))
    }

    /// Apply a terminal outcome; returns the health before and after
    pub fn record_outcome(
        &self,
        target_id: &str,
        outcome: RunState,
        at: DateTime<Utc>,
    ) -> Result<(TargetHealth, TargetHealth)> {
        let before = self.health(target_id)?;
        let mut after = before.clone();
        after.record(outcome, at);
        self.conn.execute(
            r#"
            INSERT INTO target_health (target_id, consecutive_failures, first_fail, last_ok, last_run)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(target_id) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                first_fail = excluded.first_fail,
                last_ok = excluded.last_ok,
                last_run = excluded.last_run
            "#,
            params![
                target_id,
                after.consecutive_failures,
                after.first_fail.map(to_text),
                after.last_ok.map(to_text),
                after.last_run.map(to_text),
            ],
        )?;
        Ok((before, after))
    }
}

/// Shareable handle serializing access to one [`StateStore`]
#[derive(Clone)]
pub struct AsyncStateStore {
    inner: Arc<Mutex<StateStore>>,
}

impl AsyncStateStore {
    pub fn new(store: StateStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn open(path: impl AsRef<Path>, naming: &SnapshotNaming) -> Result<Self> {
        Ok(Self::new(StateStore::open(path, naming)?))
    }

    pub async fn open_in_memory(naming: &SnapshotNaming) -> Result<Self> {
        Ok(Self::new(StateStore::open_in_memory(naming)?))
    }

    pub async fn try_acquire_lock(
        &self,
        target_id: &str,
        run_id: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .lock()
            .await
            .try_acquire_lock(target_id, run_id, holder, now)
    }

    pub async fn heartbeat(&self, target_id: &str, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.inner.lock().await.heartbeat(target_id, run_id, now)
    }

    pub async fn pin_snapshots(&self, target_id: &str, run_id: &str, pinned: &[String]) -> Result<()> {
        self.inner.lock().await.pin_snapshots(target_id, run_id, pinned)
    }

    pub async fn release_lock(&self, target_id: &str, run_id: &str) -> Result<bool> {
        self.inner.lock().await.release_lock(target_id, run_id)
    }

    pub async fn lock(&self, target_id: &str) -> Result<Option<LockRecord>> {
        self.inner.lock().await.lock(target_id)
    }

    pub async fn locks(&self) -> Result<Vec<LockRecord>> {
        self.inner.lock().await.locks()
    }

    pub async fn pinned_for(&self, dataset: &str) -> Result<HashSet<String>> {
        self.inner.lock().await.pinned_for(dataset)
    }

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        self.inner.lock().await.insert_run(run)
    }

    pub async fn finish_run(&self, run: &Run) -> Result<()> {
        self.inner.lock().await.finish_run(run)
    }

    pub async fn run(&self, run_id: &str) -> Result<Option<Run>> {
        self.inner.lock().await.run(run_id)
    }

    pub async fn recent_runs(&self, target_id: &str, limit: usize) -> Result<Vec<Run>> {
        self.inner.lock().await.recent_runs(target_id, limit)
    }

    pub async fn average_duration(&self, target_id: &str, window: usize) -> Result<Option<Duration>> {
        self.inner.lock().await.average_duration(target_id, window)
    }

    pub async fn health(&self, target_id: &str) -> Result<TargetHealth> {
        self.inner.lock().await.health(target_id)
    }

    pub async fn record_outcome(
        &self,
        target_id: &str,
        outcome: RunState,
        at: DateTime<Utc>,
    ) -> Result<(TargetHealth, TargetHealth)> {
        self.inner.lock().await.record_outcome(target_id, outcome, at)
    }
}
