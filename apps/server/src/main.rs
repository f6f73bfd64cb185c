//! FHIR Server - Web Server Entry Point
//!
//! This binary starts the HTTP server that handles FHIR API requests.
//! When `workers.embedded` is true (the default), background workers run
//! in-process on the server's job queue. For separate worker scaling, set
//! `workers.embedded: false` and use the `fhir-worker` binary.

use anyhow::Context;
use meridian::{api::create_router, config::Config, logging, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first to get logging settings
    let config = Config::load().context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _telemetry_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging/telemetry")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.logging.deployment_environment,
        "Starting FHIR Server"
    );

    let addr = config
        .socket_addr()
        .context("Failed to determine socket address")?;

    tracing::info!(
        listen_addr = %addr,
        store = ?config.store.backend,
        remote_index = config.remote_index.enabled,
        "Configuration loaded"
    );

    let state = AppState::new(config)
        .await
        .context("Failed to initialize application state")?;

    // Embedded workers share the server's store and job queue.
    let worker_handles = if state.config.workers.enabled && state.config.workers.embedded {
        Some(spawn_embedded_workers(&state))
    } else {
        if !state.config.workers.embedded {
            tracing::info!("Embedded workers disabled, use the separate fhir-worker binary");
        }
        None
    };

    let app = create_router(state);

    tracing::info!("FHIR Server listening on http://{}", addr);
    tracing::info!("Health check: http://{}/health", addr);
    tracing::info!("API endpoint: http://{}/fhir", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server terminated unexpectedly");
    }

    if let Some(handles) = worker_handles {
        tracing::info!("Shutting down embedded workers...");
        let _ = handles.shutdown_tx.send(true);
        for handle in handles.join_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Embedded worker ended with error: {}", e),
                Err(e) => tracing::error!("Embedded worker task join error: {}", e),
            }
        }
        tracing::info!("Embedded workers stopped");
    }

    tracing::info!("Server shutdown complete");

    // Explicitly shutdown telemetry (also happens via Drop on _telemetry_guard)
    logging::shutdown_telemetry();

    Ok(())
}

struct EmbeddedWorkerHandles {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    join_handles: Vec<tokio::task::JoinHandle<meridian::Result<()>>>,
}

fn spawn_embedded_workers(state: &AppState) -> EmbeddedWorkerHandles {
    use meridian::workers::{create_workers, spawn_workers_with_config, WorkerRunnerConfig};

    let workers = create_workers(
        &state.config,
        state.store.clone(),
        state.job_queue.clone(),
        state.persistence.clone(),
    );

    tracing::info!(worker_count = workers.len(), "Spawning embedded workers");
    for worker in &workers {
        tracing::info!(
            worker_name = worker.name(),
            supported_jobs = ?worker.supported_job_types(),
            batch_size = worker.batch_size(),
            "Embedded worker registered"
        );
    }

    let runner_config = WorkerRunnerConfig::from_config(&state.config.workers);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let join_handles = spawn_workers_with_config(
        workers,
        state.job_queue.clone(),
        runner_config,
        Some(shutdown_rx),
    );

    EmbeddedWorkerHandles {
        shutdown_tx,
        join_handles,
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
            tracing::info!("SIGINT received, starting graceful shutdown...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, starting graceful shutdown...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
