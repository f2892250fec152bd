//! Background worker: runs the flush, trending and sweep jobs until
//! interrupted, then performs a final flush.
//!
//! Environment:
//! - `PULSE_REDIS_URL` (default `redis://127.0.0.1:6379/`)
//! - `PULSE_SQLITE_PATH` (default `pulsestore.db`)
//! - `PULSE_*` tuning variables read by `PulseConfig::from_env`
//! - `RUST_LOG` for log filtering

use std::process::ExitCode;
use std::sync::Arc;

use pulsestore_backends::{RedisFastStore, SqliteDurableStore};
use pulsestore_core::{PulseConfig, PulseEngine};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
const DEFAULT_SQLITE_PATH: &str = "pulsestore.db";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker stopped");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = PulseConfig::from_env()?;
    let redis_url = std::env::var("PULSE_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
    let sqlite_path = std::env::var("PULSE_SQLITE_PATH").unwrap_or_else(|_| DEFAULT_SQLITE_PATH.to_string());

    let fast = Arc::new(RedisFastStore::connect(&redis_url, config.store_timeout)?);
    let durable = Arc::new(SqliteDurableStore::open(&sqlite_path, config.store_timeout)?);
    info!(redis = %redis_url, sqlite = %sqlite_path, "stores ready");

    let engine = PulseEngine::new(config, fast, durable)?;
    engine.start_jobs()?;
    info!("background jobs started");

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(shutdown_signal());

    for (name, stats) in engine.job_stats() {
        info!(job = name, cycles = stats.cycles, early_runs = stats.early_runs, "job summary");
    }
    engine.stop_jobs();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
