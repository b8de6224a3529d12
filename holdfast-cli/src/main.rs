mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use config::LoadedConfig;

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(about = "Pull-based snapshot replication with retention", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.holdfast/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init,

    /// Validate the config file and list its targets
    Check,

    /// Replicate and prune one target
    Run {
        target: String,

        /// Print transfer progress while running
        #[arg(short, long)]
        progress: bool,
    },

    /// Replicate and prune every enabled target
    RunAll,

    /// Release locks of crashed runs and close those runs
    Sweep,

    /// Show recent runs of a target
    History {
        target: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show failure streaks and locks of every target
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Estimate how long the next run of a target takes
    Estimate { target: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::get_config_path()?,
    };

    if let Commands::Init = cli.command {
        config::write_example(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let loaded = LoadedConfig::load(Some(config_path.as_path()))?;
    let ok = match cli.command {
        Commands::Init => true,
        Commands::Check => {
            commands::check(&loaded);
            true
        }
        Commands::Run { target, progress } => {
            let target = loaded.target(&target)?.clone();
            let coordinator = commands::open_coordinator(&loaded).await?;
            commands::run_one(coordinator, &target, progress).await?
        }
        Commands::RunAll => {
            let coordinator = commands::open_coordinator(&loaded).await?;
            commands::run_all(coordinator, &loaded).await?
        }
        Commands::Sweep => {
            commands::sweep(&loaded).await?;
            true
        }
        Commands::History {
            target,
            limit,
            json,
        } => {
            commands::history(&loaded, &target, limit, json).await?;
            true
        }
        Commands::Status { json } => {
            commands::status(&loaded, json).await?;
            true
        }
        Commands::Estimate { target } => {
            loaded.target(&target)?;
            let coordinator = commands::open_coordinator(&loaded).await?;
            commands::estimate(&coordinator, &target).await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
