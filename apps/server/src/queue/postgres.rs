//! PostgreSQL-backed job queue implementation using LISTEN/NOTIFY

use super::{
    helpers::{try_dequeue_job, try_dequeue_jobs, JOB_COLUMNS},
    models::*,
    traits::JobQueue,
};
use crate::{metrics, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::{PgPool, Row};
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

const CHANNEL: &str = "job_queue";

pub struct PostgresJobQueue {
    pool: PgPool,
    listen_poll_interval: Duration,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, listen_poll_interval_seconds: u64) -> Self {
        Self {
            pool,
            listen_poll_interval: Duration::from_secs(listen_poll_interval_seconds.max(1)),
        }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(
        &self,
        job_type: String,
        parameters: serde_json::Value,
        priority: JobPriority,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let retry_policy_json = serde_json::to_value(retry_policy.unwrap_or_default())
            .map_err(|e| crate::Error::JobQueue(format!("Failed to serialize retry policy: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, parameters, priority, retry_policy)
            VALUES ($1, $2, 'pending', $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(&job_type)
        .bind(&parameters)
        .bind(priority as i32)
        .bind(retry_policy_json)
        .execute(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        // Notify waiting workers
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(&job_type)
            .execute(&self.pool)
            .await
            .map_err(crate::Error::Database)?;

        metrics::JOBS_ENQUEUED_TOTAL.with_label_values(&[&job_type]).inc();
        tracing::debug!(job_id = %job_id, job_type = %job_type, ?priority, "Enqueued job");

        Ok(job_id)
    }

    async fn dequeue(&self, job_types: &[String], worker_id: &str) -> Result<Option<Job>> {
        let job = try_dequeue_job(&self.pool, job_types, worker_id).await?;
        if let Some(ref job) = job {
            tracing::debug!(job_id = %job.id, job_type = %job.job_type, worker_id, "Dequeued job");
        }
        Ok(job)
    }

    async fn dequeue_batch(&self, job_types: &[String], worker_id: &str, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        try_dequeue_jobs(&self.pool, job_types, worker_id, limit).await
    }

    async fn listen<'a>(&'a self, job_types: &'a [String]) -> Result<BoxStream<'a, Result<Job>>> {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool)
            .await
            .map_err(crate::Error::Database)?;

        listener.listen(CHANNEL).await.map_err(crate::Error::Database)?;

        tracing::info!(
            "Job queue listener started on channel '{}' for job types: {:?}",
            CHANNEL,
            job_types
        );

        let pool = self.pool.clone();
        let job_types = job_types.to_vec();
        let worker_id = format!("listener-{}", Uuid::new_v4());
        let listen_poll_interval = self.listen_poll_interval;

        let stream = async_stream::stream! {
            // Drain jobs that were enqueued while nobody listened.
            loop {
                match try_dequeue_job(&pool, &job_types, &worker_id).await {
                    Ok(Some(job)) => yield Ok(job),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error polling for jobs: {}", e);
                        yield Err(e);
                        break;
                    }
                }
            }

            let mut interval = tokio::time::interval(listen_poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let should_try_dequeue = tokio::select! {
                    recv_res = listener.recv() => {
                        match recv_res {
                            Ok(notification) => {
                                let notified_job_type = notification.payload();
                                tracing::trace!("Received job notification for type: {}", notified_job_type);
                                job_types.is_empty() || job_types.iter().any(|t| t == notified_job_type)
                            }
                            Err(e) => {
                                tracing::error!("Error receiving notification: {}", e);
                                yield Err(crate::Error::Database(e));
                                break;
                            }
                        }
                    }
                    // Rescheduled jobs become due without a notification.
                    _ = interval.tick() => true,
                };

                if !should_try_dequeue {
                    continue;
                }

                loop {
                    match try_dequeue_job(&pool, &job_types, &worker_id).await {
                        Ok(Some(job)) => yield Ok(job),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!("Error dequeuing job: {}", e);
                            yield Err(e);
                            break;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::Error::Database)?;

        Ok(job)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        processed_items: i32,
        total_items: Option<i32>,
        progress_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut query_builder = sqlx::QueryBuilder::new("UPDATE jobs SET processed_items = ");
        query_builder.push_bind(processed_items);

        if let Some(total) = total_items {
            query_builder.push(", total_items = ");
            query_builder.push_bind(total);
        }

        if let Some(progress) = progress_data {
            query_builder.push(", progress = ");
            query_builder.push_bind(progress);
        }

        query_builder.push(" WHERE id = ");
        query_builder.push_bind(job_id);

        query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(crate::Error::Database)?;

        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, final_results: Option<serde_json::Value>) -> Result<()> {
        let now = chrono::Utc::now();

        // A cancel requested while running wins over completion.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN cancel_requested THEN 'cancelled' ELSE 'completed' END,
                completed_at = $1,
                progress = COALESCE($2, progress)
            WHERE id = $3
            RETURNING status, job_type, started_at
            "#,
        )
        .bind(now)
        .bind(final_results)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        let final_status: String = row.try_get("status").map_err(crate::Error::Database)?;
        let job_type: String = row.try_get("job_type").map_err(crate::Error::Database)?;
        let started_at: Option<chrono::DateTime<chrono::Utc>> =
            row.try_get("started_at").map_err(crate::Error::Database)?;
        metrics::JOBS_COMPLETED_TOTAL
            .with_label_values(&[&job_type, &final_status])
            .inc();
        if let Some(started_at) = started_at {
            let elapsed = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::JOB_DURATION_SECONDS
                .with_label_values(&[&job_type])
                .observe(elapsed);
        }
        tracing::debug!(job_id = %job_id, status = %final_status, "Job finished");
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error_message: String, retry: bool) -> Result<()> {
        let now = chrono::Utc::now();

        if retry {
            if let Some(job) = self.get_job(job_id).await? {
                if job.can_retry() {
                    let next_retry_delay = job.get_retry_policy().calculate_delay(job.retry_count);
                    let scheduled_at = now + chrono::Duration::seconds(next_retry_delay as i64);

                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'pending',
                            retry_count = retry_count + 1,
                            last_error_at = $1,
                            error_message = $2,
                            scheduled_at = $3,
                            worker_id = NULL
                        WHERE id = $4
                        "#,
                    )
                    .bind(now)
                    .bind(&error_message)
                    .bind(scheduled_at)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await
                    .map_err(crate::Error::Database)?;

                    tracing::warn!(
                        job_id = %job_id,
                        %scheduled_at,
                        error = %error_message,
                        "Job failed, scheduled for retry"
                    );
                    return Ok(());
                }
            }
        }

        let job_type: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = $1,
                error_message = $2,
                last_error_at = $1
            WHERE id = $3
            RETURNING job_type
            "#,
        )
        .bind(now)
        .bind(&error_message)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        if let Some(job_type) = job_type {
            metrics::JOBS_COMPLETED_TOTAL
                .with_label_values(&[&job_type, "failed"])
                .inc();
        }
        tracing::error!(job_id = %job_id, error = %error_message, "Job failed");
        Ok(())
    }

    async fn reschedule_job(&self, job_id: Uuid, delay_seconds: i32, reason: String) -> Result<()> {
        let scheduled_at = chrono::Utc::now() + chrono::Duration::seconds(delay_seconds.max(0) as i64);
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                scheduled_at = $1,
                error_message = $2,
                worker_id = NULL,
                started_at = NULL
            WHERE id = $3 AND status = 'running'
            "#,
        )
        .bind(scheduled_at)
        .bind(&reason)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        tracing::debug!(job_id = %job_id, %scheduled_at, reason = %reason, "Job rescheduled");
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let now = chrono::Utc::now();

        // Pending jobs are cancelled at once.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                cancel_requested = TRUE,
                completed_at = $1
            WHERE id = $2 AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        if result.rows_affected() > 0 {
            tracing::info!("Job {} cancelled (was pending)", job_id);
            return Ok(true);
        }

        // Running jobs see the flag and stop.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        let cancelled = result.rows_affected() > 0;
        if cancelled {
            tracing::info!("Cancellation requested for running job {}", job_id);
        } else {
            tracing::warn!("Job {} not found or already in terminal state", job_id);
        }

        Ok(cancelled)
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let result: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::Error::Database)?;

        Ok(result.unwrap_or(false))
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled
            FROM jobs
            WHERE created_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        let count = |name: &str| row.try_get::<i64, _>(name).unwrap_or(0);

        Ok(serde_json::json!({
            "status": "ok",
            "backend": "postgres",
            "stats_24h": {
                "total": count("total"),
                "pending": count("pending"),
                "running": count("running"),
                "completed": count("completed"),
                "failed": count("failed"),
                "cancelled": count("cancelled")
            }
        }))
    }

    async fn cleanup_old_jobs(&self, days: i32) -> Result<i64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(days.to_string())
        .execute(&self.pool)
        .await
        .map_err(crate::Error::Database)?;

        let deleted = result.rows_affected() as i64;
        tracing::info!("Cleaned up {} old jobs (older than {} days)", deleted, days);
        Ok(deleted)
    }
}
