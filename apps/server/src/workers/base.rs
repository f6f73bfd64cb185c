//! Base worker trait and common functionality

use crate::{queue::Job, Result};
use async_trait::async_trait;

/// Base trait for all background workers
#[async_trait]
pub trait Worker: Send + Sync {
    /// Get worker name for logging
    fn name(&self) -> &str;

    /// Get supported job types
    fn supported_job_types(&self) -> &[&str];

    /// Jobs claimed together and handed to [`Worker::process_batch`].
    fn batch_size(&self) -> usize {
        1
    }

    async fn start(&self) -> Result<()> {
        tracing::info!(worker = self.name(), "Worker starting");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        tracing::info!(worker = self.name(), "Worker stopping");
        Ok(())
    }

    /// Process a single job. The worker completes, fails or reschedules it.
    async fn process_job(&self, job: Job) -> Result<()>;

    /// Process claimed jobs. Defaults to one at a time.
    async fn process_batch(&self, jobs: Vec<Job>) -> Result<()> {
        for job in jobs {
            self.process_job(job).await?;
        }
        Ok(())
    }
}
