//! warmpoold, the warm worker pool daemon.
//!
//! Loads a `warmpool.toml`, keeps a pool of pre-started worker processes
//! sized to recent demand, and reports the pool status periodically.
//!
//! # Usage
//!
//! ```text
//! warmpoold run --config /etc/warmpool/warmpool.toml --status-interval 30
//! warmpoold check --config /etc/warmpool/warmpool.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use warmpool_core::WarmpoolConfig;
use warmpool_runtime::{ProcessFactory, WorkerFactory, WorkerPool};

#[derive(Parser)]
#[command(name = "warmpoold", about = "Warm worker pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the pool and keep it warm until Ctrl-C.
    Run {
        /// Path to warmpool.toml.
        #[arg(long)]
        config: PathBuf,

        /// Status report interval in seconds.
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
        status_interval: u64,

        /// Report status as a JSON object instead of labelled lines.
        #[arg(long)]
        json: bool,

        /// Emit logs as JSON.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a config file and print the resolved settings.
    Check {
        /// Path to warmpool.toml.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            status_interval,
            json,
            log_json,
        } => {
            init_tracing(log_json);
            run(&config, Duration::from_secs(status_interval), json).await
        }
        Command::Check { config } => {
            init_tracing(false);
            check(&config)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,warmpoold=debug,warmpool=debug"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> anyhow::Result<WarmpoolConfig> {
    WarmpoolConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(config_path: &Path, status_interval: Duration, json: bool) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let pool_config = config.pool_config()?;
    let process_config = config.process_config()?;

    info!(
        config = %config_path.display(),
        program = %process_config.program,
        startup_limit = pool_config.startup_limit,
        min = pool_config.pool_min,
        max = pool_config.pool_max,
        "warm pool daemon starting"
    );

    let pool = WorkerPool::start(ProcessFactory::new(process_config), pool_config);

    let mut ticker = tokio::time::interval(status_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                match signal {
                    Ok(()) => info!("shutdown signal received"),
                    Err(e) => error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
                }
                break;
            }
            _ = ticker.tick() => report_status(&pool, json).await?,
        }
    }

    pool.shutdown().await;
    info!("warm pool daemon stopped");
    Ok(())
}

async fn report_status<F: WorkerFactory>(pool: &WorkerPool<F>, json: bool) -> anyhow::Result<()> {
    let status = pool.status().await;
    if json {
        let line = serde_json::to_string(&status)?;
        info!(status = %line, "pool status");
    } else {
        for (label, value) in status.entries() {
            info!("{label}: {value}");
        }
    }
    Ok(())
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let pool_config = config.pool_config()?;
    let process_config = config.process_config()?;

    println!("{} is valid", config_path.display());
    println!("{pool_config:#?}");
    println!("{process_config:#?}");
    Ok(())
}
