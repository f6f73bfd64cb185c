//! Helper functions for job queue operations

use super::models::Job;
use crate::Result;
use sqlx::PgPool;

pub(super) const JOB_COLUMNS: &str = "id, job_type, status, priority, parameters, progress, \
     retry_policy, retry_count, processed_items, total_items, \
     error_message, last_error_at, scheduled_at, cancel_requested, \
     created_at, started_at, completed_at, worker_id";

/// Claim up to `limit` due jobs without blocking. Rows locked by other
/// workers are skipped.
pub async fn try_dequeue_jobs(
    pool: &PgPool,
    job_types: &[String],
    worker_id: &str,
    limit: usize,
) -> Result<Vec<Job>> {
    let now = chrono::Utc::now();

    let mut jobs = sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE jobs
        SET status = 'running',
            started_at = $1,
            worker_id = $2
        WHERE id IN (
            SELECT id
            FROM jobs
            WHERE job_type = ANY($3)
              AND status = 'pending'
              AND cancel_requested = FALSE
              AND (scheduled_at IS NULL OR scheduled_at <= $1)
            ORDER BY priority DESC, created_at ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(now)
    .bind(worker_id)
    .bind(job_types)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .map_err(crate::Error::Database)?;

    // RETURNING does not preserve the subquery order.
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    Ok(jobs)
}

/// Try to dequeue a job without blocking
pub async fn try_dequeue_job(pool: &PgPool, job_types: &[String], worker_id: &str) -> Result<Option<Job>> {
    Ok(try_dequeue_jobs(pool, job_types, worker_id, 1).await?.pop())
}
