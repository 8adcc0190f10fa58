use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Default number of attempts a job gets before it is frozen at `failed`.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Status of a photo processing job in the per-user queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One unit of processing work for a single uploaded photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub photo_id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Insertion order, breaks ties between jobs created in the same instant.
    pub seq: i64,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ProcessingJob {
    /// Whether one more failed attempt would exhaust the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// Partial update applied to a job row. `None` leaves a column untouched;
/// the nested options on nullable columns distinguish "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub retry_count: Option<i32>,
    pub processing_started_at: Option<Option<DateTime<Utc>>>,
    pub processing_completed_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
}

impl JobPatch {
    pub fn completed(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            processing_completed_at: Some(Some(now)),
            error_message: Some(None),
            ..Default::default()
        }
    }

    pub fn retry(retry_count: i32, error: &str) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            retry_count: Some(retry_count),
            processing_started_at: Some(None),
            error_message: Some(Some(error.to_string())),
            ..Default::default()
        }
    }

    pub fn failed(retry_count: i32, error: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            retry_count: Some(retry_count),
            processing_completed_at: Some(Some(now)),
            error_message: Some(Some(error.to_string())),
            ..Default::default()
        }
    }

    /// Put a claimed job back in line without consuming an attempt.
    pub fn released() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            processing_started_at: Some(None),
            ..Default::default()
        }
    }

    /// Apply the patch to an in-memory job.
    pub fn apply(&self, job: &mut ProcessingJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(started) = self.processing_started_at {
            job.processing_started_at = started;
        }
        if let Some(completed) = self.processing_completed_at {
            job.processing_completed_at = completed;
        }
        if let Some(ref error) = self.error_message {
            job.error_message = error.clone();
        }
    }
}

/// Request to create a job for a freshly saved photo.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub photo_id: Uuid,
    pub user_id: Uuid,
    pub priority: i32,
    pub max_retries: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_column_names() {
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(JobStatus::from_str("failed").unwrap(), JobStatus::Failed);
        assert!(JobStatus::from_str("queued").is_err());
    }

    #[test]
    fn test_retry_patch_clears_start_time() {
        let now = Utc::now();
        let mut job = ProcessingJob {
            id: Uuid::new_v4(),
            photo_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: JobStatus::Processing,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            created_at: now,
            seq: 1,
            processing_started_at: Some(now),
            processing_completed_at: None,
            error_message: None,
        };

        JobPatch::retry(1, "caption provider timed out").apply(&mut job);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.processing_started_at.is_none());
        assert_eq!(job.error_message.as_deref(), Some("caption provider timed out"));
    }
}
