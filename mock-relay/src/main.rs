mod activity;

use activity::Capacity;
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Stand-in relay engine: reads the rendered engine config and reports
/// synthetic activity notices on stdout, one JSON object per line.
#[derive(Parser, Debug)]
#[command(name = "mock-relay")]
#[command(about = "Mock relay engine emitting synthetic activity notices", long_about = None)]
struct Args {
    /// Engine config JSON written by the supervisor
    #[arg(long)]
    config: String,

    /// Milliseconds between activity notices
    #[arg(long, default_value = "1000", env = "MOCK_RELAY_INTERVAL_MS")]
    interval_ms: u64,

    /// Upstream bytes per notice before bandwidth limits
    #[arg(long, default_value = "262144", env = "MOCK_RELAY_BYTES_PER_TICK")]
    bytes_per_tick: u64,

    /// Exit on its own after this many activity notices
    #[arg(long, env = "MOCK_RELAY_EXIT_AFTER")]
    exit_after: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries notices, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mock_relay=info".into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let raw = tokio::fs::read(&args.config)
        .await
        .with_context(|| format!("Failed to read engine config {}", args.config))?;
    let config: Value = serde_json::from_slice(&raw).context("Engine config is not valid JSON")?;
    let capacity = Capacity::from_engine_config(&config);
    info!("Mock relay starting with {:?}", capacity);

    let interval = Duration::from_millis(args.interval_ms.max(1));
    let mut stdout = tokio::io::stdout();
    emit(
        &mut stdout,
        &activity::notice("Info", json!({"message": "mock relay started"})),
    )
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(interval);
    let mut tick = 0u64;

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => debug!("Ignoring stdin input: {}", line),
                    _ => {
                        info!("Stdin closed, stopping");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                let notice = activity::activity(tick, &capacity, interval, args.bytes_per_tick);
                emit(&mut stdout, &notice).await?;
                tick += 1;

                if args.exit_after.is_some_and(|limit| tick >= limit) {
                    info!("Exiting after {} notices", tick);
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn emit(stdout: &mut tokio::io::Stdout, notice: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(notice)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
