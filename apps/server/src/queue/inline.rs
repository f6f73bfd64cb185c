//! In-process job queue.
//!
//! Jobs live in memory and are handed to workers of the same process. Used
//! with the memory store (tests, single node) where no job table exists.
//! Workers either listen (stream) or drain the queue explicitly.

use super::{Job, JobPriority, JobQueue, JobStatus, RetryPolicy};
use crate::{metrics, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

pub struct InlineJobQueue {
    jobs: Mutex<HashMap<Uuid, Job>>,
    notify: Notify,
    poll_interval: Duration,
}

impl Default for InlineJobQueue {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InlineJobQueue {
    pub fn new(poll_interval_seconds: u64) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            poll_interval: Duration::from_secs(poll_interval_seconds.max(1)),
        }
    }

    /// Jobs in the given state, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    fn claim(&self, job_types: &[String], worker_id: &str, limit: usize) -> Vec<Job> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();
        let mut due: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.is_due(now))
            .filter(|j| job_types.is_empty() || job_types.contains(&j.job_type))
            .collect();
        due.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        due.into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.worker_id = Some(worker_id.to_string());
                job.clone()
            })
            .collect()
    }

    fn update_job<F>(&self, job_id: Uuid, f: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock();
        jobs.get_mut(&job_id).map(|job| {
            f(job);
            job.clone()
        })
    }
}

#[async_trait]
impl JobQueue for InlineJobQueue {
    async fn enqueue(
        &self,
        job_type: String,
        parameters: serde_json::Value,
        priority: JobPriority,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<Uuid> {
        let retry_policy_json = serde_json::to_value(retry_policy.unwrap_or_default())
            .map_err(|e| crate::Error::JobQueue(format!("Failed to serialize retry policy: {}", e)))?;
        let job = Job::new(job_type.clone(), parameters, priority, retry_policy_json);
        let job_id = job.id;
        self.jobs.lock().insert(job_id, job);
        self.notify.notify_waiters();

        metrics::JOBS_ENQUEUED_TOTAL.with_label_values(&[&job_type]).inc();
        tracing::debug!(job_id = %job_id, job_type = %job_type, "Enqueued in-process job");
        Ok(job_id)
    }

    async fn dequeue(&self, job_types: &[String], worker_id: &str) -> Result<Option<Job>> {
        Ok(self.claim(job_types, worker_id, 1).pop())
    }

    async fn dequeue_batch(&self, job_types: &[String], worker_id: &str, limit: usize) -> Result<Vec<Job>> {
        Ok(self.claim(job_types, worker_id, limit))
    }

    async fn listen<'a>(&'a self, job_types: &'a [String]) -> Result<BoxStream<'a, Result<Job>>> {
        let worker_id = format!("inline-{}", Uuid::new_v4());
        let stream = async_stream::stream! {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                while let Some(job) = self.claim(job_types, &worker_id, 1).pop() {
                    yield Ok(job);
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = interval.tick() => {}
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().get(&job_id).cloned())
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        processed_items: i32,
        total_items: Option<i32>,
        progress_data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.update_job(job_id, |job| {
            job.processed_items = processed_items;
            if let Some(total) = total_items {
                job.total_items = Some(total);
            }
            if progress_data.is_some() {
                job.progress = progress_data;
            }
        });
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, final_results: Option<serde_json::Value>) -> Result<()> {
        let now = Utc::now();
        let job = self.update_job(job_id, |job| {
            job.status = if job.cancel_requested {
                JobStatus::Cancelled
            } else {
                JobStatus::Completed
            };
            job.completed_at = Some(now);
            if final_results.is_some() {
                job.progress = final_results;
            }
        });
        if let Some(job) = job {
            metrics::JOBS_COMPLETED_TOTAL
                .with_label_values(&[&job.job_type, job.status.as_str()])
                .inc();
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error_message: String, retry: bool) -> Result<()> {
        let now = Utc::now();
        let job = self.update_job(job_id, |job| {
            job.last_error_at = Some(now);
            job.error_message = Some(error_message.clone());
            if retry && job.can_retry() {
                let delay = job.get_retry_policy().calculate_delay(job.retry_count);
                job.retry_count += 1;
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.scheduled_at = Some(now + chrono::Duration::seconds(delay as i64));
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
        });
        if let Some(job) = job.filter(|j| j.status == JobStatus::Failed) {
            metrics::JOBS_COMPLETED_TOTAL
                .with_label_values(&[&job.job_type, "failed"])
                .inc();
            tracing::error!(job_id = %job_id, error = %error_message, "Job failed");
        }
        Ok(())
    }

    async fn reschedule_job(&self, job_id: Uuid, delay_seconds: i32, reason: String) -> Result<()> {
        let scheduled_at = Utc::now() + chrono::Duration::seconds(delay_seconds.max(0) as i64);
        self.update_job(job_id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.scheduled_at = Some(scheduled_at);
                job.error_message = Some(reason);
                job.worker_id = None;
                job.started_at = None;
            }
        });
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let job = self.update_job(job_id, |job| match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.cancel_requested = true;
                job.completed_at = Some(now);
            }
            JobStatus::Running => job.cancel_requested = true,
            _ => {}
        });
        Ok(job.is_some_and(|j| j.cancel_requested))
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        Ok(self
            .jobs
            .lock()
            .get(&job_id)
            .is_some_and(|j| j.cancel_requested))
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        let jobs = self.jobs.lock();
        let count = |status: JobStatus| jobs.values().filter(|j| j.status == status).count();
        Ok(serde_json::json!({
            "status": "ok",
            "backend": "inline",
            "stats": {
                "total": jobs.len(),
                "pending": count(JobStatus::Pending),
                "running": count(JobStatus::Running),
                "completed": count(JobStatus::Completed),
                "failed": count(JobStatus::Failed),
                "cancelled": count(JobStatus::Cancelled)
            }
        }))
    }

    async fn cleanup_old_jobs(&self, days: i32) -> Result<i64> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.is_complete() && j.completed_at.is_some_and(|at| at < cutoff)));
        Ok((before - jobs.len()) as i64)
    }
}
