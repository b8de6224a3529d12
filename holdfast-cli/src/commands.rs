//! Operations behind each subcommand

use anyhow::{Context, Result};
use chrono::Utc;
use holdfast_sync::{
    AsyncStateStore, FileConfigStore, RecoverySweep, Run, RunCoordinator, RunState, Target,
    TracingAlertSink,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LoadedConfig;

pub async fn open_state(loaded: &LoadedConfig) -> Result<AsyncStateStore> {
    let engine = &loaded.config.engine;
    let naming = engine.naming().context("Invalid snapshot naming")?;
    AsyncStateStore::open(&engine.database_path, &naming)
        .await
        .with_context(|| {
            format!(
                "Failed to open state database: {}",
                engine.database_path.display()
            )
        })
}

pub async fn open_coordinator(loaded: &LoadedConfig) -> Result<Arc<RunCoordinator>> {
    let engine = loaded.config.engine.clone();
    let state = open_state(loaded).await?;
    let store = holdfast_transport::zfs_store(&engine);
    let transports = holdfast_transport::registry(&engine, &loaded.config.targets)
        .context("Failed to configure transports")?;

    let coordinator = RunCoordinator::new(
        engine,
        state,
        Arc::new(store),
        transports,
        Arc::new(TracingAlertSink),
    )
    .context("Failed to start run coordinator")?;
    Ok(Arc::new(coordinator))
}

/// Cancel every active run on the first ctrl-c
pub fn cancel_on_interrupt(coordinator: Arc<RunCoordinator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling active runs");
            coordinator.cancel_all().await;
        }
    })
}

/// Print progress of `target_id` every `every` until the task is aborted
pub fn watch_progress(
    coordinator: Arc<RunCoordinator>,
    target_id: String,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(progress) = coordinator.progress(&target_id).await {
                eprintln!(
                    "  {} {} {} / {} ({:.0}%){}",
                    progress.state,
                    progress.current_dataset.as_deref().unwrap_or("-"),
                    format_bytes(progress.transferred_bytes),
                    format_bytes(progress.estimated_bytes),
                    progress.percentage(),
                    progress
                        .estimated_completion
                        .map(|at| format!(", done around {}", at.format("%H:%M")))
                        .unwrap_or_default()
                );
            }
        }
    })
}

pub async fn run_one(
    coordinator: Arc<RunCoordinator>,
    target: &Target,
    show_progress: bool,
) -> Result<bool> {
    let interrupt = cancel_on_interrupt(coordinator.clone());
    let watcher = show_progress.then(|| {
        watch_progress(
            coordinator.clone(),
            target.target_id.clone(),
            Duration::from_secs(5),
        )
    });

    let result = coordinator.dispatch(target).await;
    interrupt.abort();
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let run = result.with_context(|| format!("Run of {} did not start", target.target_id))?;
    print_run(&run);
    Ok(run.is_success())
}

/// Returns true when every dispatched run succeeded
pub async fn run_all(coordinator: Arc<RunCoordinator>, loaded: &LoadedConfig) -> Result<bool> {
    let interrupt = cancel_on_interrupt(coordinator.clone());
    let store = FileConfigStore::new(&loaded.path);
    let results = coordinator.dispatch_configured(&store).await;
    interrupt.abort();

    let mut all_ok = true;
    for (target_id, result) in results.context("Failed to read targets")? {
        match result {
            Ok(run) => {
                all_ok &= run.is_success();
                print_run(&run);
            }
            Err(e) => {
                all_ok = false;
                println!("{}: not run: {}", target_id, e);
            }
        }
    }
    Ok(all_ok)
}

pub async fn sweep(loaded: &LoadedConfig) -> Result<()> {
    let state = open_state(loaded).await?;
    let sweep = RecoverySweep::new(state, loaded.config.engine.stale_lock_timeout());
    let stats = sweep.sweep(Utc::now()).await.context("Recovery sweep failed")?;
    println!(
        "Inspected {} locks, released {}, closed {} abandoned runs",
        stats.locks_inspected, stats.locks_released, stats.runs_abandoned
    );
    Ok(())
}

pub async fn history(loaded: &LoadedConfig, target_id: &str, limit: usize, json: bool) -> Result<()> {
    loaded.target(target_id)?;
    let state = open_state(loaded).await?;
    let runs = state
        .recent_runs(target_id, limit)
        .await
        .context("Failed to read run history")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs recorded for {}", target_id);
    }
    for run in &runs {
        println!(
            "{}  {:<20} {:>10} {:>10}  {}",
            run.start_time.format("%Y-%m-%d %H:%M"),
            run.state,
            format_bytes(run.transferred_bytes),
            run.duration()
                .and_then(|d| d.to_std().ok())
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string()),
            run.error_detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn estimate(coordinator: &RunCoordinator, target_id: &str) -> Result<()> {
    match coordinator.estimated_duration(target_id).await? {
        Some(duration) => println!("{}: about {}", target_id, format_duration(duration)),
        None => println!("{}: no completed runs to estimate from", target_id),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct TargetStatus {
    pub target_id: String,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub last_ok: Option<chrono::DateTime<Utc>>,
    pub last_run: Option<chrono::DateTime<Utc>>,
    pub locked_by: Option<String>,
}

pub async fn status(loaded: &LoadedConfig, json: bool) -> Result<()> {
    let state = open_state(loaded).await?;
    let mut statuses = Vec::new();
    for target in &loaded.config.targets {
        let health = state.health(&target.target_id).await?;
        let lock = state.lock(&target.target_id).await?;
        statuses.push(TargetStatus {
            target_id: target.target_id.clone(),
            enabled: target.enabled,
            consecutive_failures: health.consecutive_failures,
            last_ok: health.last_ok,
            last_run: health.last_run,
            locked_by: lock.map(|l| format!("{} (run {})", l.holder, l.run_id)),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    for status in &statuses {
        let last_ok = status
            .last_ok
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<20} {:<8} failures={:<3} last ok {}{}",
            status.target_id,
            if status.enabled { "enabled" } else { "disabled" },
            status.consecutive_failures,
            last_ok,
            status
                .locked_by
                .as_deref()
                .map(|l| format!(", locked by {}", l))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn check(loaded: &LoadedConfig) {
    println!("{} is valid", loaded.path.display());
    println!("  state database: {}", loaded.config.engine.database_path.display());
    for target in &loaded.config.targets {
        println!(
            "  {} [{}{}] {} -> {} keep {}",
            target.target_id,
            target.transport,
            if target.enabled { "" } else { ", disabled" },
            target.remote,
            target.local,
            target.policy.retention
        );
    }
}

fn print_run(run: &Run) {
    let mark = match run.state {
        RunState::Succeeded => "ok",
        RunState::PartiallySucceeded => "partial",
        RunState::Cancelled => "cancelled",
        _ => "FAILED",
    };
    println!(
        "{}: {} ({} moved, run {})",
        run.target_id,
        mark,
        format_bytes(run.transferred_bytes),
        run.run_id
    );
    for dataset in &run.datasets {
        let range = match (&dataset.from, &dataset.to) {
            (Some(from), Some(to)) => format!("{}..{}", from, to),
            (None, Some(to)) => to.clone(),
            _ => "-".to_string(),
        };
        println!(
            "  {:<40} {:?} {}{}",
            dataset.dataset.local.dataset,
            dataset.status,
            range,
            if dataset.remaining > 0 {
                format!(" ({} snapshots behind)", dataset.remaining)
            } else {
                String::new()
            }
        );
        if !dataset.pruned.is_empty() {
            debug!("Pruned from {}: {:?}", dataset.dataset.local, dataset.pruned);
            println!("    pruned {} snapshots", dataset.pruned.len());
        }
        for failure in &dataset.prune_failures {
            println!("    prune failed: {}", failure);
        }
        if let Some(error) = &dataset.error {
            println!("    error: {}", error);
        }
    }
    if let Some(detail) = &run.error_detail {
        println!("  {}", detail);
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {:02}s", m, s),
        (h, m, _) => format!("{}h {:02}m", h, m),
    }
}
