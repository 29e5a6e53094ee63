//! tickvaultd: run the collection engine as a daemon.
//!
//! Exit codes: 0 normal (a first ctrl-c drives a graceful shutdown),
//! 1 configuration error, 2 startup failure, 130 interrupted before the
//! shutdown drain could complete (second ctrl-c).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tickvault::{Collector, CollectorBuilder, CollectorConfig, JsonlArchive};
use tickvault_types::{CoordinatorMode, env_overrides_help};

const EXIT_CONFIG: u8 = 1;
const EXIT_STARTUP: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "tickvaultd", version, about = "Market-data collection and archival daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine.
    Run {
        /// Path to the JSON configuration file.
        #[arg(long, env = "TICKVAULT_CONFIG")]
        config: Option<PathBuf>,

        /// Archive root; overrides the config file and environment.
        /// (`TICKVAULT_DATA_ROOT` is handled by the config layer.)
        #[arg(long)]
        data_root: Option<PathBuf>,

        /// Shutdown drain bound in seconds; overrides the config file and
        /// environment.
        #[arg(long)]
        drain_timeout: Option<u64>,

        /// Pipeline queue capacity; overrides the config file and
        /// environment.
        #[arg(long)]
        pipeline_capacity: Option<usize>,
    },
    /// Print the recognized environment overrides.
    EnvHelp,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::EnvHelp => {
            println!("{}", env_overrides_help());
            ExitCode::SUCCESS
        }
        Commands::Run {
            config,
            data_root,
            drain_timeout,
            pipeline_capacity,
        } => {
            let cfg = match load_config(config, data_root, drain_timeout, pipeline_capacity) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!(error = %err, "configuration error");
                    return ExitCode::from(EXIT_CONFIG);
                }
            };
            match run(cfg).await {
                Ok(code) => code,
                Err(err) => {
                    error!(error = %err, "startup failed");
                    ExitCode::from(EXIT_STARTUP)
                }
            }
        }
    }
}

fn load_config(
    config: Option<PathBuf>,
    data_root: Option<PathBuf>,
    drain_timeout: Option<u64>,
    pipeline_capacity: Option<usize>,
) -> Result<CollectorConfig, tickvault::VaultError> {
    let mut cfg = match config {
        Some(path) => {
            let data = std::fs::read(&path).map_err(|err| {
                tickvault::VaultError::invalid_arg(format!(
                    "cannot read config {}: {err}",
                    path.display()
                ))
            })?;
            serde_json::from_slice(&data).map_err(|err| {
                tickvault::VaultError::invalid_arg(format!(
                    "cannot parse config {}: {err}",
                    path.display()
                ))
            })?
        }
        None => CollectorConfig::default(),
    };

    cfg.apply_env_overrides(std::env::vars())?;

    // CLI flags win over file and environment.
    if let Some(root) = data_root {
        cfg.data_root = root;
    }
    if let Some(secs) = drain_timeout {
        cfg.pipeline.drain_timeout = Duration::from_secs(secs);
    }
    if let Some(capacity) = pipeline_capacity {
        cfg.pipeline.capacity = capacity;
    }
    if cfg.data_root.as_os_str().is_empty() {
        return Err(tickvault::VaultError::invalid_arg(
            "data root is required (--data-root or config)",
        ));
    }

    cfg.validate()?;
    Ok(cfg)
}

async fn run(cfg: CollectorConfig) -> Result<ExitCode, tickvault::VaultError> {
    let archive = Arc::new(JsonlArchive::new(&cfg.data_root)?);
    let state_dir = cfg.data_root.join("state");

    let mut builder = CollectorBuilder::new()
        .with_archive(archive.clone())
        .state_dir(state_dir);
    for (task_type, task) in archive.maintenance_tasks() {
        builder = builder.with_task(task_type, task);
    }
    if cfg.coordinator.mode == CoordinatorMode::FileLock {
        let claims_dir = cfg
            .coordinator
            .claims_dir
            .clone()
            .unwrap_or_else(|| cfg.data_root.join("claims"));
        let ttl = cfg.coordinator.heartbeat_interval * cfg.coordinator.ttl_multiplier;
        builder = builder.with_coordinator(Arc::new(tickvault::FileLockCoordinator::new(
            format!("tickvaultd-{}", std::process::id()),
            claims_dir,
            ttl,
        )));
    }

    let collector: Collector = builder.config(cfg).build()?;
    collector.start().await?;
    info!("tickvaultd running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| tickvault::VaultError::Other(format!("signal handler failed: {err}")))?;
    info!("interrupt received; draining");

    // A clean drain is the normal completion path. A second interrupt cuts
    // the drain short and exits with the interrupted code.
    tokio::select! {
        () = collector.shutdown() => {
            info!("shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("second interrupt; exiting without a full drain");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
    }
}
