//! Run coordination
//!
//! The [`RunCoordinator`] owns the lifecycle of every run: it takes the
//! per-target lock, walks the run through its phases for every dataset of
//! the target, records the outcome and raises alerts. Errors of every
//! component are turned into run outcomes here.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::{Alert, AlertSink};
use crate::ancestor::{AncestorResolver, Resolution};
use crate::config::{ConfigStore, EngineConfig, Target};
use crate::errors::{Result, SyncError};
use crate::executor::{cancellable, control, TransferExecutor};
use crate::history::{HistoryFilter, SnapshotHistory, SnapshotStore};
use crate::naming::SnapshotNaming;
use crate::planner::{PlanDecision, TransferMode, TransferPlan, TransferPlanner};
use crate::progress::{ProgressHandle, RunProgress};
use crate::retention::RetentionPruner;
use crate::run::{DatasetResult, DatasetStatus, Run, RunState};
use crate::scheduler::DispatchQueue;
use crate::snapshot::{DatasetPair, Side};
use crate::state::{pin_key, AsyncStateStore};
use crate::transport::TransportRegistry;

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    handle: ProgressHandle,
    progress: RunProgress,
}

/// Everything one run needs, resolved once per dispatch
struct RunContext<'a> {
    target: &'a Target,
    run_id: String,
    filter: HistoryFilter,
    remote_store: Arc<dyn SnapshotStore>,
    executor: TransferExecutor,
    planner: TransferPlanner,
    cancel: CancellationToken,
    handle: ProgressHandle,
}

pub struct RunCoordinator {
    config: EngineConfig,
    naming: SnapshotNaming,
    state: AsyncStateStore,
    store: Arc<dyn SnapshotStore>,
    transports: TransportRegistry,
    alerts: Arc<dyn AlertSink>,
    holder: String,
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl RunCoordinator {
    /// `store` serves the local side of every target and the remote side of
    /// targets whose transport has no store of its own
    pub fn new(
        config: EngineConfig,
        state: AsyncStateStore,
        store: Arc<dyn SnapshotStore>,
        transports: TransportRegistry,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        config.validate()?;
        let naming = config.naming()?;
        let holder = format!(
            "{}:{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            std::process::id()
        );
        Ok(Self {
            config,
            naming,
            state,
            store,
            transports,
            alerts,
            holder,
            active: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn state(&self) -> &AsyncStateStore {
        &self.state
    }

    pub fn naming(&self) -> &SnapshotNaming {
        &self.naming
    }

    /// Run the pipeline once for `target`
    ///
    /// Returns `AlreadyRunning` without creating a run when the target is
    /// locked. Otherwise the finished run is returned whatever its outcome;
    /// the lock is released on every path, panics included.
    #[instrument(skip(self, target), fields(target = %target.target_id))]
    pub async fn dispatch(&self, target: &Target) -> Result<Run> {
        target.validate()?;
        let transport = self.transports.get(target.transport)?;
        let remote_store = self
            .transports
            .remote_store(target.transport)
            .unwrap_or_else(|| self.store.clone());

        let mut run = Run::new(&target.target_id);
        run.retry_count = self.state.health(&target.target_id).await?.consecutive_failures;

        let acquired = self
            .state
            .try_acquire_lock(&target.target_id, &run.run_id, &self.holder, Utc::now())
            .await?;
        if !acquired {
            info!("Skipping {}: a run is already active", target.target_id);
            return Err(SyncError::AlreadyRunning(target.target_id.clone()));
        }
        run.transition(RunState::Locked)?;
        if let Err(e) = self.state.insert_run(&run).await {
            self.release(&target.target_id, &run.run_id).await;
            return Err(e);
        }
        info!("Run {} started for {}", run.run_id, target.target_id);

        let cancel = CancellationToken::new();
        let handle = ProgressHandle::new();
        let mut progress = RunProgress::new(run.run_id.clone(), target.target_id.clone());
        progress.state = RunState::Locked;
        if let Ok(Some(estimate)) = self.estimated_duration(&target.target_id).await {
            progress.estimated_completion = chrono::Duration::from_std(estimate)
                .ok()
                .map(|d| progress.start_time + d);
        }
        self.active.write().await.insert(
            target.target_id.clone(),
            ActiveRun {
                run_id: run.run_id.clone(),
                cancel: cancel.clone(),
                handle: handle.clone(),
                progress,
            },
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(
            target.target_id.clone(),
            run.run_id.clone(),
            heartbeat_stop.clone(),
            cancel.clone(),
        );

        let ctx = RunContext {
            target,
            run_id: run.run_id.clone(),
            filter: HistoryFilter::new(self.naming.clone(), target.owner_tag.clone()),
            executor: TransferExecutor::new(
                self.store.clone(),
                transport,
                self.config.control_timeout(),
            ),
            remote_store,
            planner: TransferPlanner::for_target(target),
            cancel,
            handle,
        };

        let outcome = AssertUnwindSafe(self.pipeline(&ctx, &mut run))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if !run.state.is_terminal() {
                    if matches!(e, SyncError::Cancelled) {
                        info!("Run {} for {} cancelled", run.run_id, target.target_id);
                    } else {
                        error!("Run {} for {} failed: {}", run.run_id, target.target_id, e);
                    }
                    run.transferred_bytes = run.datasets.iter().map(|d| d.bytes).sum();
                    run.fail(&e)?;
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Run {} for {} panicked: {}", run.run_id, target.target_id, message);
                if !run.state.is_terminal() {
                    run.fail(&SyncError::Internal(format!("panic: {}", message)))?;
                }
            }
        }

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task for {} ended abnormally: {}", target.target_id, e);
        }

        if let Err(e) = self.state.finish_run(&run).await {
            error!("Failed to record run {}: {}", run.run_id, e);
        }
        self.release(&target.target_id, &run.run_id).await;
        self.active.write().await.remove(&target.target_id);

        self.report(&run).await;
        Ok(run)
    }

    /// Dispatch every enabled target, at most `max_concurrent_runs` at a
    /// time, oldest last attempt first
    pub async fn dispatch_many(&self, targets: &[Target]) -> Vec<(String, Result<Run>)> {
        let mut queue = DispatchQueue::new(self.config.max_concurrent_runs);
        let mut by_id: HashMap<&str, &Target> = HashMap::new();
        for target in targets {
            if !target.enabled {
                debug!("Target {} is disabled, skipping", target.target_id);
                continue;
            }
            let last_attempt = match self.state.health(&target.target_id).await {
                Ok(health) => health.last_run,
                Err(e) => {
                    warn!("No health record for {}: {}", target.target_id, e);
                    None
                }
            };
            queue.schedule(target.target_id.clone(), last_attempt);
            by_id.insert(target.target_id.as_str(), target);
        }

        let mut running = FuturesUnordered::new();
        let mut results = Vec::new();
        loop {
            while let Some(target_id) = queue.next_target() {
                if let Some(target) = by_id.get(target_id.as_str()).copied() {
                    running.push(async move {
                        let result = self.dispatch(target).await;
                        (target_id, result)
                    });
                } else {
                    queue.complete();
                }
            }
            match running.next().await {
                Some(result) => {
                    queue.complete();
                    results.push(result);
                }
                None => break,
            }
        }
        results
    }

    /// Dispatch every target of a config store with its current policy
    pub async fn dispatch_configured(
        &self,
        config: &dyn ConfigStore,
    ) -> Result<Vec<(String, Result<Run>)>> {
        let mut targets = config.list_targets().await?;
        for target in &mut targets {
            target.policy = config.get_policy(&target.target_id).await?;
        }
        Ok(self.dispatch_many(&targets).await)
    }

    /// Cancel the active run of `target_id`; `false` when none is active
    pub async fn cancel(&self, target_id: &str) -> bool {
        match self.active.read().await.get(target_id) {
            Some(active) => {
                info!("Cancelling run {} for {}", active.run_id, target_id);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run
    pub async fn cancel_all(&self) {
        for active in self.active.read().await.values() {
            active.cancel.cancel();
        }
    }

    pub async fn progress(&self, target_id: &str) -> Option<RunProgress> {
        self.active.read().await.get(target_id).map(|active| {
            let mut progress = active.progress.clone();
            progress.sync_from(&active.handle);
            progress
        })
    }

    /// Rolling average duration of recent runs that moved data
    pub async fn estimated_duration(&self, target_id: &str) -> Result<Option<Duration>> {
        self.state
            .average_duration(target_id, self.config.duration_window)
            .await
    }

    async fn pipeline(&self, ctx: &RunContext<'_>, run: &mut Run) -> Result<()> {
        let target = ctx.target;

        self.enter(run, RunState::Resolving).await?;
        let pairs = self.datasets(ctx).await?;
        let mut resolutions: Vec<Option<Resolution>> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let mut result = DatasetResult::new(pair.clone());
            self.set_current(target, &pair).await;
            match self.resolve(ctx, &pair).await {
                Ok(resolution) => resolutions.push(Some(resolution)),
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!("Cannot resolve {}: {}", pair, e);
                    result.fail(&e);
                    resolutions.push(None);
                }
            }
            run.datasets.push(result);
        }
        if run.datasets.iter().all(DatasetResult::is_settled) {
            run.settle()?;
            return Ok(());
        }

        self.enter(run, RunState::Planning).await?;
        let mut plans: Vec<Option<TransferPlan>> = Vec::with_capacity(resolutions.len());
        let mut pins = Vec::new();
        for (result, resolution) in run.datasets.iter_mut().zip(resolutions) {
            let Some(resolution) = resolution else {
                plans.push(None);
                continue;
            };
            if let Some(common) = &resolution.common {
                pins.push(pin_key(&result.dataset.local.dataset, &common.name));
            }
            match ctx.planner.plan(&resolution, &target.policy) {
                Ok(PlanDecision::NoOp { at, .. }) => {
                    debug!("{} is up to date", result.dataset);
                    result.status = DatasetStatus::UpToDate;
                    result.to = at.map(|s| s.name);
                    plans.push(None);
                }
                Ok(PlanDecision::Transfer(plan)) => {
                    pins.push(pin_key(&result.dataset.local.dataset, &plan.to.name));
                    result.mode = Some(plan.mode);
                    result.from = plan.from_name().map(str::to_string);
                    result.to = Some(plan.to.name.clone());
                    result.remaining = plan.remaining;
                    plans.push(Some(plan));
                }
                Err(e) => {
                    warn!("Cannot plan {}: {}", result.dataset, e);
                    result.fail(&e);
                    plans.push(None);
                }
            }
        }
        self.state
            .pin_snapshots(&target.target_id, &ctx.run_id, &pins)
            .await?;
        if run.datasets.iter().all(|d| d.status == DatasetStatus::Failed) {
            run.settle()?;
            return Ok(());
        }

        self.enter(run, RunState::Transferring).await?;
        for (index, plan) in plans.iter().enumerate() {
            let Some(plan) = plan else { continue };
            self.set_current(target, &plan.dataset).await;
            match ctx.executor.execute(plan, &ctx.handle, &ctx.cancel).await {
                Ok(report) => {
                    let result = &mut run.datasets[index];
                    result.status = DatasetStatus::Transferred;
                    result.bytes += report.bytes_transferred;
                    result.estimated_bytes += report.estimated_bytes;
                    if plan.follow_ups > 0 {
                        self.catch_up(ctx, plan, result, &mut pins).await?;
                    }
                }
                Err(SyncError::Cancelled) => {
                    run.datasets[index].fail(&SyncError::Cancelled);
                    return Err(SyncError::Cancelled);
                }
                Err(e) => {
                    warn!("Transfer of {} failed: {}", plan.dataset, e);
                    run.datasets[index].fail(&e);
                }
            }
        }

        if run.prunable().next().is_some() {
            self.enter(run, RunState::Pruning).await?;
            for result in run.datasets.iter_mut().filter(|d| d.status.is_success()) {
                self.set_current(target, &result.dataset).await;
                self.prune(ctx, result).await?;
            }
        }

        let outcome = run.settle()?;
        self.set_state(&target.target_id, outcome).await;
        Ok(())
    }

    /// Root dataset plus, for recursive targets, every child in name order
    async fn datasets(&self, ctx: &RunContext<'_>) -> Result<Vec<DatasetPair>> {
        let root = ctx.target.root_pair();
        if !ctx.target.recursive {
            return Ok(vec![root]);
        }
        let children = control(
            &ctx.cancel,
            self.config.control_timeout(),
            "child dataset listing",
            ctx.remote_store.list_children(&root.remote),
        )
        .await
        .map_err(|e| match e {
            SyncError::Cancelled | SyncError::Unreachable { .. } => e,
            other => SyncError::unreachable(Side::Remote, other.to_string()),
        })?;

        let mut suffixes: Vec<&str> = children
            .iter()
            .filter_map(|child| root.remote.relative(child))
            .collect();
        suffixes.sort_unstable();
        let mut pairs = vec![root.clone()];
        pairs.extend(suffixes.into_iter().map(|suffix| root.child(suffix)));
        debug!("{} has {} datasets", ctx.target.target_id, pairs.len());
        Ok(pairs)
    }

    /// Capture both sides concurrently and find the common ancestor
    async fn resolve(&self, ctx: &RunContext<'_>, pair: &DatasetPair) -> Result<Resolution> {
        let timeout = self.config.control_timeout();
        let (local, remote) = cancellable(&ctx.cancel, async {
            Ok(tokio::join!(
                SnapshotHistory::list(
                    self.store.as_ref(),
                    &pair.local,
                    Side::Local,
                    &ctx.filter,
                    timeout
                ),
                SnapshotHistory::list(
                    ctx.remote_store.as_ref(),
                    &pair.remote,
                    Side::Remote,
                    &ctx.filter,
                    timeout
                ),
            ))
        })
        .await?;
        AncestorResolver::new().resolve(&local?, &remote?)
    }

    /// Follow-up incrementals right after an initial transfer
    ///
    /// Best effort: a failure leaves the dataset transferred but raises
    /// `CatchUpIncomplete`.
    async fn catch_up(
        &self,
        ctx: &RunContext<'_>,
        initial: &TransferPlan,
        result: &mut DatasetResult,
        pins: &mut Vec<String>,
    ) -> Result<()> {
        for attempt in 1..=initial.follow_ups {
            let step = async {
                let resolution = self.resolve(ctx, &initial.dataset).await?;
                ctx.planner.plan(&resolution, &ctx.target.policy)
            }
            .await;

            let plan = match step {
                Ok(PlanDecision::Transfer(plan)) if plan.mode == TransferMode::Incremental => plan,
                Ok(_) => {
                    result.remaining = 0;
                    return Ok(());
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => return self.catch_up_failed(ctx, initial, result, e).await,
            };

            pins.push(pin_key(&initial.dataset.local.dataset, &plan.to.name));
            self.state
                .pin_snapshots(&ctx.target.target_id, &ctx.run_id, pins)
                .await?;

            debug!("Follow-up {} for {}: {}", attempt, initial.dataset, plan);
            match ctx.executor.execute(&plan, &ctx.handle, &ctx.cancel).await {
                Ok(report) => {
                    result.bytes += report.bytes_transferred;
                    result.estimated_bytes += report.estimated_bytes;
                    result.follow_ups_completed += 1;
                    result.to = Some(plan.to.name.clone());
                    result.remaining = plan.remaining;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => return self.catch_up_failed(ctx, initial, result, e).await,
            }
            if plan.remaining == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn catch_up_failed(
        &self,
        ctx: &RunContext<'_>,
        initial: &TransferPlan,
        result: &DatasetResult,
        err: SyncError,
    ) -> Result<()> {
        warn!("Follow-up incremental for {} failed: {}", initial.dataset, err);
        self.alerts
            .notify(&Alert::CatchUpIncomplete {
                target_id: ctx.target.target_id.clone(),
                dataset: initial.dataset.local.to_string(),
                remaining: result.remaining,
                detail: err.to_string(),
            })
            .await;
        Ok(())
    }

    /// Prune one successful dataset against a fresh local capture
    async fn prune(&self, ctx: &RunContext<'_>, result: &mut DatasetResult) -> Result<()> {
        let history = match cancellable(
            &ctx.cancel,
            SnapshotHistory::list(
                self.store.as_ref(),
                &result.dataset.local,
                Side::Local,
                &ctx.filter,
                self.config.control_timeout(),
            ),
        )
        .await
        {
            Ok(history) => history,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                warn!("Skipping pruning of {}: {}", result.dataset.local, e);
                result.prune_failures.push(e.to_string());
                return Ok(());
            }
        };

        let mut protected: HashSet<String> =
            self.state.pinned_for(&result.dataset.local.dataset).await?;
        protected.extend(result.from.iter().cloned());
        protected.extend(result.to.iter().cloned());

        let pruner = RetentionPruner::new(self.store.clone(), self.config.control_timeout());
        let report = pruner
            .prune(&history, &ctx.target.policy.retention, &protected, &ctx.cancel)
            .await?;
        result.pruned.extend(report.deleted);
        result
            .prune_failures
            .extend(report.failures.iter().map(ToString::to_string));
        Ok(())
    }

    async fn enter(&self, run: &mut Run, state: RunState) -> Result<()> {
        run.transition(state)?;
        debug!("Run {} entered {}", run.run_id, state);
        self.set_state(&run.target_id, state).await;
        Ok(())
    }

    async fn set_current(&self, target: &Target, dataset: &DatasetPair) {
        if let Some(active) = self.active.write().await.get_mut(&target.target_id) {
            active.progress.current_dataset = Some(dataset.to_string());
        }
    }

    async fn set_state(&self, target_id: &str, state: RunState) {
        if let Some(active) = self.active.write().await.get_mut(target_id) {
            active.progress.state = state;
        }
    }

    fn spawn_heartbeat(
        &self,
        target_id: String,
        run_id: String,
        stop: CancellationToken,
        run_cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let state = self.state.clone();
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match state.heartbeat(&target_id, &run_id, Utc::now()).await {
                            Ok(true) => debug!("Heartbeat for {} ({})", target_id, run_id),
                            Ok(false) => {
                                error!("Lock on {} lost by run {}, cancelling", target_id, run_id);
                                run_cancel.cancel();
                                break;
                            }
                            Err(e) => warn!("Heartbeat for {} failed: {}", target_id, e),
                        }
                    }
                }
            }
        })
    }

    async fn release(&self, target_id: &str, run_id: &str) {
        match self.state.release_lock(target_id, run_id).await {
            Ok(true) => debug!("Released lock on {}", target_id),
            Ok(false) => warn!("Lock on {} was no longer held by run {}", target_id, run_id),
            Err(e) => error!("Failed to release lock on {}: {}", target_id, e),
        }
    }

    /// Record the outcome against the target's health and raise alerts
    async fn report(&self, run: &Run) {
        let now = run.end_time.unwrap_or_else(Utc::now);
        let (before, after) = match self.state.record_outcome(&run.target_id, run.state, now).await {
            Ok(health) => health,
            Err(e) => {
                error!("Failed to record health of {}: {}", run.target_id, e);
                return;
            }
        };

        let recovered_since = match run.state {
            RunState::Succeeded if before.consecutive_failures > 0 => before.first_fail,
            _ => None,
        };
        info!(
            "Run {} for {} finished: {} ({} bytes)",
            run.run_id, run.target_id, run.state, run.transferred_bytes
        );
        self.alerts
            .notify(&Alert::RunFinished {
                target_id: run.target_id.clone(),
                run_id: run.run_id.clone(),
                outcome: run.state,
                duration: run
                    .duration()
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or_default(),
                transferred_bytes: run.transferred_bytes,
                error: run.error_detail.clone(),
                recovered_since,
            })
            .await;

        let failed = matches!(run.state, RunState::Failed | RunState::PartiallySucceeded);
        if failed && after.consecutive_failures >= self.config.persistent_failure_threshold {
            self.alerts
                .notify(&Alert::PersistentFailure {
                    target_id: run.target_id.clone(),
                    consecutive_failures: after.consecutive_failures,
                    first_fail: after.first_fail,
                    last_error: run.error_detail.clone(),
                })
                .await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
