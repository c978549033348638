mod clock;
mod config;
mod engine;
mod error;
mod metrics;
mod notice;
mod persist;
mod service;
mod stats;
mod supervisor;
mod traffic;

use anyhow::{Context, Result};
use clap::Parser;
use config::SupervisorConfig;
use mimalloc::MiMalloc;
use service::Service;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "relay-supervisor")]
#[command(about = "Relay supervisor - runs the relay engine within a traffic quota", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "supervisor.toml", env = "RELAY_CONFIG")]
    config: String,

    /// Directory for engine data and persisted quota state
    #[arg(long, env = "RELAY_DATA_DIR")]
    data_dir: Option<String>,

    /// Prometheus listen address, e.g. ":9090"
    #[arg(long, env = "RELAY_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Write live stats as JSON to this file
    #[arg(long, env = "RELAY_STATS_FILE")]
    stats_file: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Show engine diagnostics (-v)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = Path::new(&args.config).exists();
    let mut cfg = if config_found {
        SupervisorConfig::load(&args.config)
            .with_context(|| format!("Failed to load config file {}", args.config))?
    } else {
        SupervisorConfig::default()
    };

    // Override with command line arguments
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(metrics_addr) = args.metrics_addr {
        cfg.metrics_addr = Some(metrics_addr);
    }
    if let Some(stats_file) = args.stats_file {
        cfg.stats_file = Some(stats_file);
    }
    if let Some(log_level) = args.log_level {
        cfg.log_level = log_level;
    }
    cfg.verbosity = cfg.verbosity.max(args.verbose);

    cfg.validate().context("Invalid configuration")?;

    let _guard = common::init_tracing(
        cfg.log_dir.as_deref(),
        &cfg.log_file,
        &cfg.log_level,
        cfg.console_port,
    );

    if config_found {
        info!("Loaded configuration from {}", args.config);
    } else {
        info!("No config file at {}, using defaults", args.config);
    }

    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down relay supervisor");
            root.cancel();
        }
    });

    Service::new(cfg)
        .run(root)
        .await
        .context("Relay supervisor failed")?;

    info!("Relay supervisor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
