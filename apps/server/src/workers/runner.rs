//! Runs workers against the job queue

use super::base::Worker;
use crate::{queue::Job, queue::JobQueue, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct WorkerRunnerConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_jitter_ratio: f64,
}

impl WorkerRunnerConfig {
    pub fn from_config(config: &crate::config::WorkerConfig) -> Self {
        Self {
            reconnect_initial: Duration::from_secs(config.reconnect_initial_seconds),
            reconnect_max: Duration::from_secs(config.reconnect_max_seconds),
            reconnect_jitter_ratio: config.reconnect_jitter_ratio,
        }
    }
}

impl Default for WorkerRunnerConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter_ratio: 0.2,
        }
    }
}

/// `base` scaled by a random factor in `[1 - ratio, 1 + ratio]`.
pub fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }
    let value = Uuid::new_v4().as_u128() as u64;
    let unit = (value as f64) / (u64::MAX as f64);
    let signed = unit * 2.0 - 1.0;
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

fn job_types_of(worker: &dyn Worker) -> Vec<String> {
    worker
        .supported_job_types()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Top up `first` with already due jobs, up to the worker's batch size.
async fn fill_batch(
    worker: &dyn Worker,
    job_queue: &dyn JobQueue,
    job_types: &[String],
    worker_id: &str,
    first: Job,
) -> Vec<Job> {
    let mut batch = vec![first];
    let limit = worker.batch_size().saturating_sub(1);
    if limit > 0 {
        match job_queue.dequeue_batch(job_types, worker_id, limit).await {
            Ok(more) => batch.extend(more),
            Err(e) => tracing::warn!(worker = worker.name(), error = %e, "Failed to fill job batch"),
        }
    }
    batch
}

/// Hand a batch to the worker. A batch that errors as a whole is failed
/// with retry, unless the worker already settled its jobs.
async fn dispatch(worker: &dyn Worker, job_queue: &dyn JobQueue, batch: Vec<Job>) {
    let ids: Vec<Uuid> = batch.iter().map(|j| j.id).collect();
    let size = batch.len();
    match worker.process_batch(batch).await {
        Ok(()) => tracing::debug!(worker = worker.name(), jobs = size, "Processed job batch"),
        Err(e) => {
            tracing::error!(worker = worker.name(), jobs = size, error = %e, "Failed to process job batch");
            for id in ids {
                let still_running = matches!(
                    job_queue.get_job(id).await,
                    Ok(Some(job)) if job.status == crate::queue::JobStatus::Running
                );
                if still_running {
                    if let Err(fail_err) = job_queue.fail_job(id, e.to_string(), true).await {
                        tracing::error!(job_id = %id, error = %fail_err, "Failed to record job failure");
                    }
                }
            }
        }
    }
}

/// Process due jobs until none is left. Returns the number of jobs handed
/// to the worker.
pub async fn drain(worker: &dyn Worker, job_queue: &dyn JobQueue) -> Result<usize> {
    let job_types = job_types_of(worker);
    let worker_id = format!("{}-drain-{}", worker.name(), Uuid::new_v4());
    let mut handled = 0;
    loop {
        let batch = job_queue
            .dequeue_batch(&job_types, &worker_id, worker.batch_size().max(1))
            .await?;
        if batch.is_empty() {
            return Ok(handled);
        }
        handled += batch.len();
        dispatch(worker, job_queue, batch).await;
    }
}

/// Run a worker by listening to the job queue and processing jobs
pub async fn run_worker(worker: Arc<dyn Worker>, job_queue: Arc<dyn JobQueue>) -> Result<()> {
    run_worker_with_config(worker, job_queue, WorkerRunnerConfig::default(), None).await
}

pub async fn run_worker_with_config(
    worker: Arc<dyn Worker>,
    job_queue: Arc<dyn JobQueue>,
    runner_config: WorkerRunnerConfig,
    mut shutdown: Option<watch::Receiver<bool>>,
) -> Result<()> {
    let job_types = job_types_of(worker.as_ref());
    let worker_id = format!("{}-{}", worker.name(), Uuid::new_v4());

    tracing::info!(worker = worker.name(), job_types = ?job_types, "Worker listening");
    worker.start().await?;

    let mut reconnect_delay = runner_config.reconnect_initial;

    loop {
        if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
            tracing::info!(worker = worker.name(), "Shutdown requested");
            return worker.stop().await;
        }

        // LISTEN connections can drop. The stream then ends and is recreated.
        let mut job_stream = match job_queue.listen(&job_types).await {
            Ok(stream) => {
                reconnect_delay = runner_config.reconnect_initial;
                stream
            }
            Err(e) => {
                tracing::error!(
                    worker = worker.name(),
                    error = %e,
                    retry_in = ?reconnect_delay,
                    "Failed to create job listener"
                );
                sleep(jittered_duration(reconnect_delay, runner_config.reconnect_jitter_ratio)).await;
                reconnect_delay = (reconnect_delay * 2).min(runner_config.reconnect_max);
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = async {
                    match shutdown.as_mut() {
                        Some(rx) => { let _ = rx.changed().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                        tracing::info!(worker = worker.name(), "Shutdown requested");
                        return worker.stop().await;
                    }
                }
                next = job_stream.next() => {
                    match next {
                        Some(Ok(job)) => {
                            tracing::debug!(worker = worker.name(), job_id = %job.id, "Received job");
                            let batch = fill_batch(
                                worker.as_ref(),
                                job_queue.as_ref(),
                                &job_types,
                                &worker_id,
                                job,
                            )
                            .await;
                            dispatch(worker.as_ref(), job_queue.as_ref(), batch).await;
                        }
                        Some(Err(e)) => {
                            tracing::error!(worker = worker.name(), error = %e, "Error receiving job");
                        }
                        None => break,
                    }
                }
            }
        }

        tracing::warn!(
            worker = worker.name(),
            retry_in = ?reconnect_delay,
            "Job stream ended, reconnecting"
        );
        sleep(jittered_duration(reconnect_delay, runner_config.reconnect_jitter_ratio)).await;
        reconnect_delay = (reconnect_delay * 2).min(runner_config.reconnect_max);
    }
}

pub fn spawn_workers_with_config(
    workers: Vec<Box<dyn Worker>>,
    job_queue: Arc<dyn JobQueue>,
    runner_config: WorkerRunnerConfig,
    shutdown: Option<watch::Receiver<bool>>,
) -> Vec<tokio::task::JoinHandle<Result<()>>> {
    workers
        .into_iter()
        .map(|worker| {
            let worker: Arc<dyn Worker> = Arc::from(worker);
            let queue = job_queue.clone();
            let cfg = runner_config.clone();
            let shutdown_rx = shutdown.clone();
            tokio::spawn(async move { run_worker_with_config(worker, queue, cfg, shutdown_rx).await })
        })
        .collect()
}
