use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::ProcessingJob;
use crate::models::search::{RankEvent, RankedCandidate, SearchCandidate};

/// Request to queue processing for a photo that was just saved.
#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueJobRequest {
    #[garde(skip)]
    pub photo_id: Uuid,

    #[garde(skip)]
    pub user_id: Uuid,

    #[garde(range(min = -100, max = 100))]
    pub priority: Option<i32>,
}

/// Response after queueing a photo.
#[derive(Debug, Serialize)]
pub struct EnqueueJobResponse {
    pub job_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub photo_id: Uuid,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error: Option<String>,
}

impl From<ProcessingJob> for JobStatusResponse {
    fn from(job: ProcessingJob) -> Self {
        Self {
            job_id: job.id,
            photo_id: job.photo_id,
            status: job.status.to_string(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            error: job.error_message,
        }
    }
}

/// Response after asking for a worker invocation.
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub user_id: Uuid,
    pub scheduled: bool,
}

/// Request to rank raw similarity hits for a query.
#[derive(Debug, Deserialize, Validate)]
pub struct RankRequest {
    #[garde(length(min = 1, max = 500))]
    pub query: String,

    #[garde(length(max = 200), dive)]
    pub candidates: Vec<SearchCandidate>,

    /// Run the vision verification stage.
    #[serde(default)]
    #[garde(skip)]
    pub verify: bool,
}

#[derive(Debug, Serialize)]
pub struct RankResponse {
    pub query: String,
    pub results: Vec<RankedCandidate>,
    pub events: Vec<RankEvent>,
}
