use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::face::{NamedDescriptor, NewFaceProfile};
use crate::models::job::{JobPatch, NewJob, ProcessingJob};
use crate::models::photo::{Photo, PhotoPatch};

/// Persistence seam for the processing queue.
///
/// The job table is the only coordination point between worker invocations,
/// so implementations must make `claim_next_job` a single conditional
/// transition: a job moves `pending -> processing` only if no other job of
/// the same user is already `processing`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job for a saved photo and move the photo to `queued`.
    async fn create_job(&self, job: &NewJob) -> Result<ProcessingJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, StoreError>;

    /// Reset the user's `processing` jobs started before `started_before` to
    /// `pending`, incrementing `retry_count` and recording `reason`. Their
    /// photos go back to `queued`. Returns the jobs after the reset.
    async fn reset_stale_jobs(
        &self,
        user_id: Uuid,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<ProcessingJob>, StoreError>;

    async fn find_processing_job(&self, user_id: Uuid)
        -> Result<Option<ProcessingJob>, StoreError>;

    /// Atomically claim the user's next pending job (priority desc,
    /// created_at asc, seq asc), stamping `processing_started_at = now`.
    /// Returns `None` when nothing is pending or another job holds the slot.
    async fn claim_next_job(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingJob>, StoreError>;

    async fn count_pending_jobs(&self, user_id: Uuid) -> Result<i64, StoreError>;

    async fn update_job(&self, job_id: Uuid, patch: &JobPatch) -> Result<(), StoreError>;

    /// Return every `processing` job of the user to `pending` without
    /// consuming an attempt. Returns how many were released.
    async fn release_processing_jobs(&self, user_id: Uuid) -> Result<u64, StoreError>;

    async fn get_photo(&self, photo_id: Uuid) -> Result<Option<Photo>, StoreError>;

    async fn update_photo(&self, photo_id: Uuid, patch: &PhotoPatch) -> Result<(), StoreError>;

    async fn insert_face_profile(&self, profile: &NewFaceProfile) -> Result<Uuid, StoreError>;

    async fn list_named_descriptors(&self, user_id: Uuid)
        -> Result<Vec<NamedDescriptor>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid column value: {0}")]
    InvalidColumn(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}
