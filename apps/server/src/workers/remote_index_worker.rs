//! Remote index consumer
//!
//! Claims `remote_index` jobs in batches, lets the handler write the values
//! of every message whose version committed, and settles each job by its
//! outcome:
//! - processed / skipped: complete
//! - not ready: rescheduled, not counted as a retry
//! - expired / rejected: failed without retry

use super::base::Worker;
use crate::{
    config::RemoteIndexConfig,
    db::ResourceStore,
    metrics,
    queue::{Job, JobQueue, REMOTE_INDEX_JOB},
    remote_index::{MessageOutcome, RemoteIndexHandler, RemoteIndexJob},
    Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub struct RemoteIndexWorker {
    job_queue: Arc<dyn JobQueue>,
    handler: RemoteIndexHandler,
    batch_size: usize,
    not_ready_retry_seconds: i32,
}

impl RemoteIndexWorker {
    pub fn new(job_queue: Arc<dyn JobQueue>, store: Arc<dyn ResourceStore>, config: &RemoteIndexConfig) -> Self {
        Self {
            job_queue,
            handler: RemoteIndexHandler::new(store, config),
            batch_size: config.batch_size.max(1),
            not_ready_retry_seconds: config.not_ready_retry_seconds,
        }
    }

    async fn settle(&self, job: &Job, outcome: &MessageOutcome) -> Result<()> {
        metrics::REMOTE_INDEX_MESSAGES_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        match outcome {
            MessageOutcome::Processed => {
                self.job_queue
                    .complete_job(job.id, Some(serde_json::json!({"outcome": "processed"})))
                    .await
            }
            MessageOutcome::Skipped(reason) => {
                self.job_queue
                    .complete_job(
                        job.id,
                        Some(serde_json::json!({"outcome": "skipped", "reason": reason})),
                    )
                    .await
            }
            MessageOutcome::NotReady => {
                self.job_queue
                    .reschedule_job(
                        job.id,
                        self.not_ready_retry_seconds,
                        "resource version not committed yet".to_string(),
                    )
                    .await
            }
            MessageOutcome::Expired => {
                self.job_queue
                    .fail_job(
                        job.id,
                        "resource version did not commit within the ready time".to_string(),
                        false,
                    )
                    .await
            }
            MessageOutcome::Rejected(reason) => self.job_queue.fail_job(job.id, reason.clone(), false).await,
        }
    }
}

#[async_trait]
impl Worker for RemoteIndexWorker {
    fn name(&self) -> &str {
        "RemoteIndexWorker"
    }

    fn supported_job_types(&self) -> &[&str] {
        &[REMOTE_INDEX_JOB]
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn process_job(&self, job: Job) -> Result<()> {
        self.process_batch(vec![job]).await
    }

    async fn process_batch(&self, jobs: Vec<Job>) -> Result<()> {
        let started = Instant::now();
        metrics::REMOTE_INDEX_BATCH_SIZE
            .with_label_values(&[self.name()])
            .observe(jobs.len() as f64);

        let mut decoded = Vec::with_capacity(jobs.len());
        for job in jobs {
            match RemoteIndexJob::from_parameters(&job.parameters) {
                Ok(params) => decoded.push((job, params.message)),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Dropping malformed remote index job");
                    self.settle(&job, &MessageOutcome::Rejected(e.to_string())).await?;
                }
            }
        }
        if decoded.is_empty() {
            return Ok(());
        }

        let messages: Vec<_> = decoded.iter().map(|(_, m)| m.clone()).collect();
        // A failed batch surfaces as an error: the runner fails the jobs
        // with retry.
        let outcomes = self.handler.process(&messages).await?;

        for ((job, _), outcome) in decoded.iter().zip(&outcomes) {
            self.settle(job, outcome).await?;
        }

        tracing::info!(
            messages = messages.len(),
            processed = outcomes.iter().filter(|o| **o == MessageOutcome::Processed).count(),
            not_ready = outcomes.iter().filter(|o| **o == MessageOutcome::NotReady).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Remote index batch settled"
        );
        Ok(())
    }
}
