//! Calendar-bucketed retention
//!
//! For every unit with a non-zero count the newest snapshot of each of the
//! newest `count` populated buckets survives; the unions over all units, the
//! `extra` newest snapshots, the newest snapshot and any protected name form
//! the keep-set. Everything else is destroyed, oldest first. Buckets are UTC
//! hours, days, ISO weeks, months and years.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::executor::control;
use crate::history::{SnapshotHistory, SnapshotStore};
use crate::policy::{RetentionPolicy, RetentionUnit};
use crate::snapshot::Snapshot;

#[derive(Debug, Default)]
pub struct PruneReport {
    /// Destroyed snapshots, oldest first
    pub deleted: Vec<String>,
    pub kept_count: usize,
    /// One `PruneFailure` per snapshot that could not be destroyed
    pub failures: Vec<SyncError>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn bucket(unit: RetentionUnit, at: DateTime<Utc>) -> i64 {
    match unit {
        RetentionUnit::Hourly => {
            at.date_naive().num_days_from_ce() as i64 * 24 + at.hour() as i64
        }
        RetentionUnit::Daily => at.date_naive().num_days_from_ce() as i64,
        RetentionUnit::Weekly => {
            let week = at.iso_week();
            week.year() as i64 * 100 + week.week() as i64
        }
        RetentionUnit::Monthly => at.year() as i64 * 12 + at.month0() as i64,
        RetentionUnit::Yearly => at.year() as i64,
    }
}

/// Names to keep from a newest-first snapshot list
pub fn keep_set<'a>(
    snapshots: &'a [Snapshot],
    policy: &RetentionPolicy,
    protected: &HashSet<String>,
) -> HashSet<&'a str> {
    let mut keep: HashSet<&str> = HashSet::new();

    for (unit, count) in policy.units() {
        let mut seen = HashSet::new();
        for snapshot in snapshots {
            if seen.len() == count {
                break;
            }
            if seen.insert(bucket(unit, snapshot.created_at)) {
                keep.insert(snapshot.name.as_str());
            }
        }
    }

    keep.extend(snapshots.iter().take(policy.extra).map(|s| s.name.as_str()));
    if let Some(newest) = snapshots.first() {
        keep.insert(newest.name.as_str());
    }
    keep.extend(
        snapshots
            .iter()
            .filter(|s| protected.contains(&s.name))
            .map(|s| s.name.as_str()),
    );
    keep
}

/// Destroys snapshots outside the keep-set
pub struct RetentionPruner {
    store: Arc<dyn SnapshotStore>,
    control_timeout: Duration,
}

impl RetentionPruner {
    pub fn new(store: Arc<dyn SnapshotStore>, control_timeout: Duration) -> Self {
        Self {
            store,
            control_timeout,
        }
    }

    /// Prune a freshly captured history
    ///
    /// Individual failures are logged and collected; pruning continues with
    /// the next snapshot. Cancellation stops before the next deletion.
    pub async fn prune(
        &self,
        history: &SnapshotHistory,
        policy: &RetentionPolicy,
        protected: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<PruneReport> {
        let keep = keep_set(history.snapshots(), policy, protected);
        let doomed: Vec<&Snapshot> = history
            .iter()
            .rev()
            .filter(|s| !keep.contains(s.name.as_str()))
            .collect();

        let mut report = PruneReport {
            kept_count: keep.len(),
            ..Default::default()
        };
        if doomed.is_empty() {
            debug!("Nothing to prune in {} ({} kept)", history.endpoint(), keep.len());
            return Ok(report);
        }

        for snapshot in doomed {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let outcome = control(
                cancel,
                self.control_timeout,
                "snapshot destroy",
                self.store.destroy_snapshot(history.endpoint(), &snapshot.name),
            )
            .await;
            match outcome {
                Ok(()) => {
                    debug!("Destroyed {}@{}", history.endpoint(), snapshot.name);
                    report.deleted.push(snapshot.name.clone());
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(
                        "Failed to destroy {}@{}: {}",
                        history.endpoint(),
                        snapshot.name,
                        e
                    );
                    report.failures.push(SyncError::PruneFailure {
                        snapshot: snapshot.name.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Pruned {}: {} deleted, {} kept, {} failed",
            history.endpoint(),
            report.deleted.len(),
            report.kept_count,
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryFilter;
    use crate::memory::MemoryBackend;
    use crate::naming::SnapshotNaming;
    use crate::snapshot::{Endpoint, Side};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn naming() -> SnapshotNaming {
        SnapshotNaming::default()
    }

    /// `count` snapshots `step_hours` apart, newest first
    fn series(count: usize, step_hours: i64) -> Vec<Snapshot> {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let mut snapshots: Vec<Snapshot> = (0..count)
            .map(|i| {
                let at = start + ChronoDuration::hours(i as i64 * step_hours);
                Snapshot::new(naming().format(at), at)
            })
            .collect();
        snapshots.reverse();
        snapshots
    }

    fn history_of(backend: &MemoryBackend, endpoint: &Endpoint) -> SnapshotHistory {
        SnapshotHistory::capture(
            Side::Local,
            endpoint.clone(),
            backend.snapshots(endpoint),
            &HistoryFilter::new(naming(), None),
        )
        .unwrap()
    }

    #[test]
    fn test_forty_dailies_keep_newest_25() {
        let snapshots = series(40, 24);
        let policy = RetentionPolicy::empty().with(RetentionUnit::Daily, 7).with_extra(25);
        let keep = keep_set(&snapshots, &policy, &HashSet::new());

        assert_eq!(keep.len(), 25);
        for snapshot in &snapshots[..25] {
            assert!(keep.contains(snapshot.name.as_str()));
        }
    }

    #[test]
    fn test_buckets_reach_past_extra() {
        // 90 daily snapshots: weekly and monthly buckets keep older ones
        let snapshots = series(90, 24);
        let policy = RetentionPolicy::empty()
            .with(RetentionUnit::Weekly, 8)
            .with(RetentionUnit::Monthly, 3)
            .with_extra(3);
        let keep = keep_set(&snapshots, &policy, &HashSet::new());

        assert!(keep.len() > 3);
        assert!(keep.len() <= 3 + 8 + 3);
        assert!(keep.contains(snapshots[0].name.as_str()));
        let oldest_kept = snapshots
            .iter()
            .rev()
            .find(|s| keep.contains(s.name.as_str()))
            .unwrap();
        assert!(oldest_kept.created_at < snapshots[30].created_at);
    }

    #[test]
    fn test_protected_names_survive() {
        let snapshots = series(10, 24);
        let policy = RetentionPolicy::empty().with_extra(1);
        let protected: HashSet<String> = [snapshots[9].name.clone()].into_iter().collect();
        let keep = keep_set(&snapshots, &policy, &protected);

        assert_eq!(keep.len(), 2);
        assert!(keep.contains(snapshots[9].name.as_str()));
    }

    #[test]
    fn test_newest_survives_zero_policy() {
        let snapshots = series(5, 1);
        let policy = RetentionPolicy::empty().with_extra(0);
        let keep = keep_set(&snapshots, &policy, &HashSet::new());
        assert_eq!(keep.len(), 1);
        assert!(keep.contains(snapshots[0].name.as_str()));
    }

    #[tokio::test]
    async fn test_prune_deletes_oldest_first_and_continues() {
        let backend = MemoryBackend::new();
        let endpoint = Endpoint::local("tank/www");
        let snapshots = series(10, 24);
        for snapshot in snapshots.iter().rev() {
            backend.add_snapshot(&endpoint, snapshot.clone());
        }
        backend.fail_destroy(&snapshots[8].name);

        let pruner = RetentionPruner::new(Arc::new(backend.clone()), Duration::from_secs(5));
        let policy = RetentionPolicy::empty().with_extra(5);
        let report = pruner
            .prune(
                &history_of(&backend, &endpoint),
                &policy,
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let expected: Vec<String> = [9, 7, 6, 5].iter().map(|i| snapshots[*i].name.clone()).collect();
        assert_eq!(report.deleted, expected);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            SyncError::PruneFailure { snapshot, .. } if *snapshot == snapshots[8].name
        ));
        assert_eq!(backend.names(&endpoint).len(), 6);
    }

    #[tokio::test]
    async fn test_manual_snapshots_untouched() {
        let backend = MemoryBackend::new();
        let endpoint = Endpoint::local("tank/www");
        for snapshot in series(6, 24).into_iter().rev() {
            backend.add_snapshot(&endpoint, snapshot);
        }
        let manual_at = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap();
        backend.add_snapshot(&endpoint, Snapshot::new("before-upgrade", manual_at));

        let pruner = RetentionPruner::new(Arc::new(backend.clone()), Duration::from_secs(5));
        pruner
            .prune(
                &history_of(&backend, &endpoint),
                &RetentionPolicy::empty().with_extra(1),
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let names = backend.names(&endpoint);
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"before-upgrade".to_string()));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_history() -> impl Strategy<Value = Vec<Snapshot>> {
            prop::collection::btree_set(0i64..(3 * 365 * 24), 1..120).prop_map(|hours| {
                let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
                let mut snapshots: Vec<Snapshot> = hours
                    .into_iter()
                    .map(|h| {
                        let at = start + ChronoDuration::hours(h);
                        Snapshot::new(naming().format(at), at)
                    })
                    .collect();
                snapshots.reverse();
                snapshots
            })
        }

        fn arb_policy() -> impl Strategy<Value = RetentionPolicy> {
            (0usize..30, 0usize..20, 0usize..10, 0usize..8, 0usize..3, 0usize..30).prop_map(
                |(h, d, w, m, y, extra)| RetentionPolicy {
                    hourly: h,
                    daily: d,
                    weekly: w,
                    monthly: m,
                    yearly: y,
                    extra,
                },
            )
        }

        proptest! {
            #[test]
            fn test_newest_never_pruned(snapshots in arb_history(), policy in arb_policy()) {
                let keep = keep_set(&snapshots, &policy, &HashSet::new());
                prop_assert!(keep.contains(snapshots[0].name.as_str()));
            }

            #[test]
            fn test_keep_set_bounds(snapshots in arb_history(), policy in arb_policy()) {
                let keep = keep_set(&snapshots, &policy, &HashSet::new());
                prop_assert!(keep.len() <= snapshots.len());
                prop_assert!(keep.len() >= policy.extra.min(snapshots.len()));
                for (unit, count) in policy.units() {
                    let populated: HashSet<i64> =
                        snapshots.iter().map(|s| bucket(unit, s.created_at)).collect();
                    prop_assert!(keep.len() >= populated.len().min(count));
                }
            }

            #[test]
            fn test_pruning_is_idempotent(snapshots in arb_history(), policy in arb_policy()) {
                let keep = keep_set(&snapshots, &policy, &HashSet::new());
                let survivors: Vec<Snapshot> = snapshots
                    .iter()
                    .filter(|s| keep.contains(s.name.as_str()))
                    .cloned()
                    .collect();
                let again = keep_set(&survivors, &policy, &HashSet::new());
                prop_assert_eq!(again.len(), survivors.len());
            }
        }
    }
}
