//! CLI entry point for the shot runner
//!
//! # Usage
//!
//! Run shots through the queue:
//! ```bash
//! shot-runner run --config config/shot_runner.toml /data/scanA.h5 /data/scanB.h5
//! ```
//!
//! Check a shot against the active connection table without running it:
//! ```bash
//! shot-runner validate --config config/shot_runner.toml /data/scanA.h5
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shot_core::ConnectionTable;
use shot_runner::{build_manager, check_shot, logging, ShotRunnerConfig};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shot-runner")]
#[command(about = "Synchronized shot execution for buffered hardware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Admit shots, run them in order and print the outcomes
    Run {
        /// Runner configuration file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Shot files, in queue order
        shots: Vec<PathBuf>,
    },

    /// Check a shot against the active connection table
    Validate {
        /// Runner configuration file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Shot file
        shot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, shots } => run(load_config(&config)?, shots).await,
        Commands::Validate { config, shot } => validate_shot(load_config(&config)?, shot).await,
    }
}

fn load_config(path: &Path) -> Result<ShotRunnerConfig> {
    let config = ShotRunnerConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    Ok(config)
}

async fn run(config: ShotRunnerConfig, shots: Vec<PathBuf>) -> Result<()> {
    let manager = build_manager(&config).await?;
    manager.start()?;
    info!(app = %config.application.name, shots = shots.len(), "Runner started");

    let mut rejected = 0usize;
    for shot in shots {
        match manager.admit(shot.clone()).await {
            Ok(admission) => println!("queued   {} (position {})", admission.id, admission.position),
            Err(e) => {
                rejected += 1;
                println!("rejected {}: {}", shot.display(), e);
            }
        }
    }

    tokio::select! {
        _ = manager.wait_until_idle() => {}
        _ = signal::ctrl_c() => {
            warn!("Interrupted, aborting the shot in flight");
        }
    }
    manager.shutdown().await;

    let outcomes = manager.recent_outcomes();
    for outcome in &outcomes {
        println!("{}", outcome);
    }

    let failed = outcomes.iter().filter(|o| !o.is_done()).count();
    if failed > 0 || rejected > 0 {
        bail!("{} shot(s) failed, {} rejected", failed, rejected);
    }
    Ok(())
}

async fn validate_shot(config: ShotRunnerConfig, shot: PathBuf) -> Result<()> {
    let active = ConnectionTable::from_json_file(&config.connection_table)?;
    let artifact = check_shot(&active, shot.clone()).await?;
    println!(
        "ok {} ({} devices programmed)",
        shot.display(),
        artifact.devices.len()
    );
    Ok(())
}
