//! Job queue domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Search values of one resource version handed to the remote index consumer.
pub const REMOTE_INDEX_JOB: &str = "remote_index";
/// One reindex run over logical resources not reindexed since a timestamp.
pub const REINDEX_JOB: &str = "reindex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobPriority {
    Low = 0,
    Normal = 5,
    High = 10,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub initial_delay_seconds: i32,
    pub max_delay_seconds: i32,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_seconds: 60,
            max_delay_seconds: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn calculate_delay(&self, retry_count: i32) -> i32 {
        let delay = self.initial_delay_seconds as f64 * self.backoff_multiplier.powi(retry_count);
        delay.min(self.max_delay_seconds as f64) as i32
    }
}

/// Parameters of a [`REINDEX_JOB`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexJobParams {
    /// Reindex resources whose reindex timestamp is older than this
    pub tstamp: DateTime<Utc>,
    pub resource_type: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub priority: i32,
    pub parameters: serde_json::Value,
    pub progress: Option<serde_json::Value>,
    pub retry_policy: serde_json::Value,
    pub retry_count: i32,
    pub processed_items: i32,
    pub total_items: Option<i32>,
    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

// Conversion from DB string to JobStatus
impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {}", value)),
        }
    }
}

impl Job {
    /// A new pending job.
    pub fn new(
        job_type: String,
        parameters: serde_json::Value,
        priority: JobPriority,
        retry_policy: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            priority: priority as i32,
            parameters,
            progress: None,
            retry_policy,
            retry_count: 0,
            processed_items: 0,
            total_items: None,
            error_message: None,
            last_error_at: None,
            scheduled_at: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a failure of the (running) job may be retried.
    pub fn can_retry(&self) -> bool {
        !self.cancel_requested && self.retry_count < self.get_retry_policy().max_retries
    }

    pub fn get_retry_policy(&self) -> RetryPolicy {
        serde_json::from_value(self.retry_policy.clone()).unwrap_or_default()
    }

    /// Due for pickup at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && !self.cancel_requested
            && self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn progress_percent(&self) -> Option<f64> {
        if let Some(total) = self.total_items {
            if total > 0 {
                return Some((self.processed_items as f64 / total as f64) * 100.0);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            REMOTE_INDEX_JOB.into(),
            serde_json::json!({}),
            JobPriority::Normal,
            serde_json::to_value(RetryPolicy::default()).unwrap(),
        )
    }

    #[test]
    fn retry_delay_backs_off_up_to_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(0), 60);
        assert_eq!(policy.calculate_delay(1), 120);
        assert_eq!(policy.calculate_delay(10), 3600);
    }

    #[test]
    fn running_job_can_retry_until_policy_exhausted() {
        let mut job = job();
        job.status = JobStatus::Running;
        assert!(job.can_retry());
        job.retry_count = 3;
        assert!(!job.can_retry());
        job.retry_count = 0;
        job.cancel_requested = true;
        assert!(!job.can_retry());
    }

    #[test]
    fn scheduled_jobs_are_not_due_early() {
        let now = Utc::now();
        let mut job = job();
        assert!(job.is_due(now));
        job.scheduled_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn status_parses_from_database_text() {
        assert_eq!(JobStatus::try_from("Running".to_string()), Ok(JobStatus::Running));
        assert!(JobStatus::try_from("retrying".to_string()).is_err());
    }
}
