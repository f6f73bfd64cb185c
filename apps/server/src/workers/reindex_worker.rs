//! Reindex worker
//!
//! Runs `reindex` batches until no logical resource older than the job's
//! timestamp is left, or the job is cancelled.

use super::base::Worker;
use crate::{
    models::ReindexOutcome,
    queue::{Job, JobQueue, ReindexJobParams, REINDEX_JOB},
    services::PersistenceService,
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;

pub struct ReindexWorker {
    job_queue: Arc<dyn JobQueue>,
    persistence: Arc<PersistenceService>,
}

impl ReindexWorker {
    pub fn new(job_queue: Arc<dyn JobQueue>, persistence: Arc<PersistenceService>) -> Self {
        Self {
            job_queue,
            persistence,
        }
    }
}

#[async_trait]
impl Worker for ReindexWorker {
    fn name(&self) -> &str {
        "ReindexWorker"
    }

    fn supported_job_types(&self) -> &[&str] {
        &[REINDEX_JOB]
    }

    async fn process_job(&self, job: Job) -> Result<()> {
        let params: ReindexJobParams = serde_json::from_value(job.parameters.clone())
            .map_err(|e| Error::Validation(format!("Failed to parse reindex job parameters: {}", e)))?;

        tracing::info!(
            job_id = %job.id,
            resource_type = ?params.resource_type,
            tstamp = %params.tstamp,
            "Reindex job started"
        );

        let mut total = ReindexOutcome::default();
        loop {
            if self.job_queue.is_cancelled(job.id).await? {
                tracing::info!(job_id = %job.id, "Reindex job cancelled");
                break;
            }
            let batch = self
                .persistence
                .reindex(params.batch_size.max(1), params.tstamp, params.resource_type.as_deref())
                .await?;
            if batch.processed == 0 {
                break;
            }
            total.processed += batch.processed;
            total.reindexed += batch.reindexed;
            total.unchanged += batch.unchanged;
            self.job_queue
                .update_progress(job.id, total.processed as i32, None, serde_json::to_value(&total).ok())
                .await?;
        }

        self.job_queue
            .complete_job(job.id, serde_json::to_value(&total).ok())
            .await?;
        tracing::info!(
            job_id = %job.id,
            processed = total.processed,
            reindexed = total.reindexed,
            "Reindex job finished"
        );
        Ok(())
    }
}
