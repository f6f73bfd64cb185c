//! FHIR Server - Background Worker Entry Point
//!
//! This binary runs the queue consumers outside the API server: the remote
//! index consumer (when remote indexing is enabled) and reindex runs.
//!
//! Usage:
//!   fhir-worker            # listen until SIGTERM/SIGINT
//!   fhir-worker --drain    # process due jobs once and exit

use anyhow::Context;
use clap::Parser;
use meridian::{
    config::Config,
    logging,
    state::{AppState, AppStateOptions, JobQueueKind},
    workers::{create_workers, drain, jittered_duration, spawn_workers_with_config, WorkerRunnerConfig},
};
use tokio::time::{sleep, Duration};

#[derive(Parser, Debug)]
#[clap(name = "fhir-worker")]
#[clap(about = "Background workers for remote indexing and reindex runs")]
struct Args {
    /// Process every due job once, then exit
    #[clap(long)]
    drain: bool,

    /// Run pending database migrations before starting
    #[clap(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load().context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _telemetry_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging/telemetry")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.logging.deployment_environment,
        drain = args.drain,
        "Starting FHIR Background Workers"
    );

    if !config.workers.enabled {
        tracing::warn!("Workers are disabled in configuration");
        return Ok(());
    }

    if config.workers.embedded {
        tracing::warn!(
            "workers.embedded is true, workers also run inside the fhir-server process. \
             Set workers.embedded=false to use this separate worker binary instead."
        );
    }

    // Retry on DB connectivity errors so workers don't exit on transient startup issues.
    let state = init_state_with_retry(&config, args.migrate).await?;

    let workers = create_workers(
        &state.config,
        state.store.clone(),
        state.job_queue.clone(),
        state.persistence.clone(),
    );

    tracing::info!(worker_count = workers.len(), "Created workers");
    for worker in &workers {
        tracing::info!(
            worker_name = worker.name(),
            supported_jobs = ?worker.supported_job_types(),
            batch_size = worker.batch_size(),
            "Worker registered"
        );
    }

    if args.drain {
        let mut total = 0;
        for worker in &workers {
            let handled = drain(worker.as_ref(), state.job_queue.as_ref())
                .await
                .with_context(|| format!("Failed to drain {}", worker.name()))?;
            tracing::info!(worker = worker.name(), handled, "Drained due jobs");
            total += handled;
        }
        tracing::info!(total, "Drain complete");
        logging::shutdown_telemetry();
        return Ok(());
    }

    let runner_config = WorkerRunnerConfig::from_config(&state.config.workers);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = spawn_workers_with_config(
        workers,
        state.job_queue.clone(),
        runner_config,
        Some(shutdown_rx),
    );

    tracing::info!("Workers running. Press Ctrl+C to stop.");

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Worker task ended with error: {}", e),
            Err(e) => tracing::error!("Worker task join error: {}", e),
        }
    }

    tracing::info!("Worker shutdown complete");

    logging::shutdown_telemetry();

    Ok(())
}

async fn init_state_with_retry(config: &Config, migrate: bool) -> anyhow::Result<AppState> {
    let initial = Duration::from_secs(config.workers.reconnect_initial_seconds.max(1));
    let max = Duration::from_secs(config.workers.reconnect_max_seconds.max(1));
    let jitter_ratio = config.workers.reconnect_jitter_ratio;

    let options = AppStateOptions {
        run_migrations: migrate,
        job_queue: JobQueueKind::Postgres,
        worker_pool: true,
    };

    let mut retry_delay = initial;
    loop {
        match AppState::new_with_options(config.clone(), options.clone()).await {
            Ok(state) => return Ok(state),
            Err(meridian::Error::Database(e)) => {
                tracing::error!(
                    "Failed to initialize worker state (db unavailable): {} (retrying in {:?})",
                    e,
                    retry_delay
                );
                sleep(jittered_duration(retry_delay, jitter_ratio)).await;
                retry_delay = (retry_delay * 2).min(max);
            }
            Err(e) => return Err(anyhow::anyhow!(e)).context("Failed to initialize worker state"),
        }
    }
}

/// Wait for SIGTERM (container stop) or SIGINT (Ctrl+C).
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, stopping workers...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, stopping workers...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
    tracing::info!("Shutdown signal received, stopping workers...");
}
