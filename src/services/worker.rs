//! Queue Worker.
//!
//! Drains one user's processing queue a job at a time. Exclusivity comes from
//! the claim transition in the job store, not from anything held in memory,
//! so any number of invocations may run in any number of processes. Each
//! invocation does a bounded amount of work and then schedules its own
//! continuation when more jobs are pending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::face::{DetectedFace, FaceMetadata, NamedDescriptor, NewFaceProfile};
use crate::models::job::{JobPatch, NewJob, ProcessingJob, DEFAULT_MAX_RETRIES};
use crate::models::photo::{Photo, PhotoPatch, ProcessingStatus};
use crate::services::face_matcher::{best_match, FaceMatchConfig};
use crate::services::faces::{FaceDetector, FaceProcessingError};
use crate::services::gateway::{EmbeddingGateway, ProviderError};
use crate::services::queue::{ContinuationScheduler, QueueError};
use crate::services::storage::{detect_mime_type, FetchError, ImageFetcher};

pub const STALE_RESET_REASON: &str =
    "Reset to pending: processing exceeded the stale timeout and the worker is presumed dead";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// A `processing` job older than this is considered abandoned.
    pub stale_timeout: Duration,
    /// Upper bound for the mandatory steps of one attempt: fetch, caption,
    /// embeddings and persisting them.
    pub job_timeout: Duration,
    /// Upper bound for the face phase that follows. Running out of it costs
    /// faces, never the job.
    pub face_timeout: Duration,
    /// Budget of one invocation; a new job is only started if it fits.
    pub soft_deadline: Duration,
    pub jobs_per_invocation: usize,
    pub max_retries: i32,
    pub continuation: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(5 * 60),
            job_timeout: Duration::from_secs(120),
            face_timeout: Duration::from_secs(60),
            soft_deadline: Duration::from_secs(270),
            jobs_per_invocation: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            continuation: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff for scheduling continuations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    /// Timeout of each individual scheduling call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Schedule a worker invocation for `user_id`, retrying with exponential
/// backoff. Returns the attempt number that succeeded.
pub async fn schedule_with_retry(
    scheduler: &dyn ContinuationScheduler,
    user_id: Uuid,
    policy: &RetryPolicy,
) -> Result<u32, QueueError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    let mut last_error = None;

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(policy.call_timeout, scheduler.schedule(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Unavailable(format!(
                "schedule call timed out after {:?}",
                policy.call_timeout
            ))),
        };

        match result {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    attempt = attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Failed to schedule worker continuation"
                );
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| QueueError::Unavailable("no attempts made".into())))
}

/// Result of the claim protocol.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// A pending job was moved to `processing` by this call.
    Claimed(ProcessingJob),
    /// A job was already `processing` for the user and is picked up again.
    Resumed(ProcessingJob),
    /// Nothing to do.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { faces: FaceSummary },
    /// Attempt failed, job is back in the queue.
    Retrying { retry_count: i32, error: String },
    /// Retries exhausted, job and photo frozen at `failed`.
    Failed { retry_count: i32, error: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceSummary {
    pub detected: usize,
    pub stored: usize,
    pub identified: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub photo_id: Uuid,
    pub outcome: JobOutcome,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationStatus {
    NotNeeded,
    Scheduled { attempts: u32 },
    /// Scheduling gave up; jobs left in `processing` were released.
    Failed { released: u64 },
}

#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub user_id: Uuid,
    pub jobs: Vec<JobReport>,
    pub continuation: ContinuationStatus,
}

impl InvocationReport {
    pub fn queue_was_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Failure of a mandatory step. Any of these aborts the attempt and feeds
/// the retry logic.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Photo {0} not found")]
    PhotoNotFound(Uuid),

    #[error("Image fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job exceeded the {0:?} processing timeout")]
    Timeout(Duration),
}

pub struct QueueWorker {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn ImageFetcher>,
    gateway: Arc<EmbeddingGateway>,
    scheduler: Arc<dyn ContinuationScheduler>,
    faces: Option<Arc<dyn FaceDetector>>,
    face_match: FaceMatchConfig,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn ImageFetcher>,
        gateway: Arc<EmbeddingGateway>,
        scheduler: Arc<dyn ContinuationScheduler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            gateway,
            scheduler,
            faces: None,
            face_match: FaceMatchConfig::default(),
            config,
        }
    }

    /// Enable best-effort face detection and identity matching.
    pub fn with_face_detection(mut self, detector: Arc<dyn FaceDetector>, face_match: FaceMatchConfig) -> Self {
        self.faces = Some(detector);
        self.face_match = face_match;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &'static str {
        self.gateway.provider_name()
    }

    /// Queue a freshly saved photo for processing.
    pub async fn enqueue(&self, photo_id: Uuid, user_id: Uuid, priority: i32) -> Result<ProcessingJob, StoreError> {
        let job = self
            .store
            .create_job(&NewJob {
                photo_id,
                user_id,
                priority,
                max_retries: self.config.max_retries,
            })
            .await?;

        metrics::counter!("photo_jobs_enqueued_total").increment(1);
        tracing::info!(job_id = %job.id, photo_id = %photo_id, user_id = %user_id, priority, "Photo queued for processing");
        Ok(job)
    }

    /// One bounded invocation: claim and process jobs until the per-invocation
    /// limit or the soft deadline, then hand off to a fresh invocation if the
    /// queue still has work.
    pub async fn run(&self, user_id: Uuid) -> Result<InvocationReport, StoreError> {
        let started = Instant::now();
        let mut jobs = Vec::new();

        while jobs.len() < self.config.jobs_per_invocation.max(1) {
            if !jobs.is_empty() && started.elapsed() + self.attempt_budget() > self.config.soft_deadline {
                tracing::debug!(user_id = %user_id, "Soft deadline reached, handing off");
                break;
            }

            let job = match self.claim(user_id).await? {
                ClaimOutcome::Claimed(job) | ClaimOutcome::Resumed(job) => job,
                ClaimOutcome::Empty => break,
            };
            jobs.push(self.process_job(&job).await?);
        }

        if jobs.is_empty() {
            tracing::debug!(user_id = %user_id, "Queue empty");
            return Ok(InvocationReport {
                user_id,
                jobs,
                continuation: ContinuationStatus::NotNeeded,
            });
        }

        let continuation = self.continue_if_pending(user_id).await?;
        Ok(InvocationReport {
            user_id,
            jobs,
            continuation,
        })
    }

    /// Longest a single attempt can take.
    fn attempt_budget(&self) -> Duration {
        match self.faces {
            Some(_) => self.config.job_timeout + self.config.face_timeout,
            None => self.config.job_timeout,
        }
    }

    /// The claim protocol: reset stale jobs, resume an in-flight job, or
    /// claim the next pending one.
    pub async fn claim(&self, user_id: Uuid) -> Result<ClaimOutcome, StoreError> {
        let now = Utc::now();
        let stale_timeout = chrono::Duration::from_std(self.config.stale_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let reset = self
            .store
            .reset_stale_jobs(user_id, now - stale_timeout, STALE_RESET_REASON)
            .await?;
        for job in &reset {
            metrics::counter!("photo_jobs_stale_reset_total").increment(1);
            tracing::warn!(
                job_id = %job.id,
                photo_id = %job.photo_id,
                retry_count = job.retry_count,
                "Reset stale processing job"
            );
        }

        if let Some(job) = self.store.find_processing_job(user_id).await? {
            tracing::info!(job_id = %job.id, user_id = %user_id, "Resuming job already in processing");
            self.sync_photo_status(job.photo_id, ProcessingStatus::Processing).await?;
            return Ok(ClaimOutcome::Resumed(job));
        }

        loop {
            let Some(job) = self.store.claim_next_job(user_id, Utc::now()).await? else {
                return Ok(ClaimOutcome::Empty);
            };

            if job.retry_count >= job.max_retries {
                // Only reachable through repeated stale resets.
                let error = format!(
                    "Processing failed after {} retries: {}",
                    job.max_retries,
                    job.error_message.as_deref().unwrap_or("worker did not finish")
                );
                self.store
                    .update_job(job.id, &JobPatch::failed(job.max_retries, &error, Utc::now()))
                    .await?;
                self.sync_photo_status(job.photo_id, ProcessingStatus::Failed).await?;
                metrics::counter!("photo_jobs_failed_total").increment(1);
                tracing::error!(job_id = %job.id, retry_count = job.retry_count, "Job exhausted retries before processing");
                continue;
            }

            metrics::counter!("photo_jobs_claimed_total").increment(1);
            tracing::info!(job_id = %job.id, photo_id = %job.photo_id, user_id = %user_id, "Claimed job");
            self.sync_photo_status(job.photo_id, ProcessingStatus::Processing).await?;
            return Ok(ClaimOutcome::Claimed(job));
        }
    }

    /// Drive one claimed job to `completed`, back to `pending`, or `failed`.
    pub async fn process_job(&self, job: &ProcessingJob) -> Result<JobReport, StoreError> {
        let start = Instant::now();

        let attempt = match tokio::time::timeout(self.config.job_timeout, self.run_steps(job)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::Timeout(self.config.job_timeout)),
        };

        let outcome = match attempt {
            Ok((photo, bytes)) => {
                let faces = self.run_face_phase(&photo, &bytes).await;
                self.store.update_job(job.id, &JobPatch::completed(Utc::now())).await?;
                self.sync_photo_status(job.photo_id, ProcessingStatus::Completed).await?;

                metrics::counter!("photo_jobs_completed_total").increment(1);
                metrics::histogram!("photo_processing_seconds").record(start.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %job.id,
                    photo_id = %job.photo_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    faces_detected = faces.detected,
                    faces_stored = faces.stored,
                    "Job completed"
                );
                JobOutcome::Completed { faces }
            }
            Err(e) => self.record_failure(job, &e).await?,
        };

        Ok(JobReport {
            job_id: job.id,
            photo_id: job.photo_id,
            outcome,
            duration: start.elapsed(),
        })
    }

    /// Mandatory steps. Returns the photo and its bytes for the face phase.
    async fn run_steps(&self, job: &ProcessingJob) -> Result<(Photo, Vec<u8>), ProcessingError> {
        let photo = self
            .store
            .get_photo(job.photo_id)
            .await?
            .ok_or(ProcessingError::PhotoNotFound(job.photo_id))?;

        tracing::debug!(job_id = %job.id, location = %photo.storage_path, "Fetching image");
        let bytes = self.fetcher.fetch_image_bytes(&photo.storage_path).await?;
        let mime_type = detect_mime_type(&bytes, photo.mime_type.as_deref());

        let provider_start = Instant::now();
        let analysis = self.gateway.analyze(&bytes, &mime_type).await?;
        tracing::info!(
            job_id = %job.id,
            provider = self.gateway.provider_name(),
            provider_duration_ms = provider_start.elapsed().as_millis() as u64,
            caption_len = analysis.caption.len(),
            image_embedding = analysis.embedding_alt.is_some(),
            "Caption and embedding generated"
        );

        // Persist before any face work so search data survives a later crash.
        self.store
            .update_photo(
                photo.id,
                &PhotoPatch {
                    caption: Some(analysis.caption),
                    embedding: Some(analysis.embedding),
                    embedding_alt: analysis.embedding_alt,
                    ..Default::default()
                },
            )
            .await?;

        Ok((photo, bytes))
    }

    /// Best-effort: nothing in here can fail the job. Faces stored before the
    /// face timeout fires are kept.
    async fn run_face_phase(&self, photo: &Photo, bytes: &[u8]) -> FaceSummary {
        let mut summary = FaceSummary::default();
        let Some(ref detector) = self.faces else {
            return summary;
        };

        let phase = self.process_faces(detector.as_ref(), photo, bytes, &mut summary);
        if tokio::time::timeout(self.config.face_timeout, phase).await.is_err() {
            summary.errors += 1;
            tracing::warn!(
                photo_id = %photo.id,
                timeout_ms = self.config.face_timeout.as_millis() as u64,
                faces_stored = summary.stored,
                "Face processing timed out, completing without remaining faces"
            );
        }

        metrics::counter!("face_profiles_inserted_total").increment(summary.stored as u64);
        summary
    }

    async fn process_faces(
        &self,
        detector: &dyn FaceDetector,
        photo: &Photo,
        bytes: &[u8],
        summary: &mut FaceSummary,
    ) {
        let detected = match detector.detect_faces(bytes).await {
            Ok(faces) => faces,
            Err(e) => {
                summary.errors += 1;
                tracing::warn!(photo_id = %photo.id, error = %e, "Face detection failed, continuing without faces");
                return;
            }
        };
        summary.detected = detected.len();
        if detected.is_empty() {
            return;
        }

        let named = match self.store.list_named_descriptors(photo.user_id).await {
            Ok(named) => named,
            Err(e) => {
                tracing::warn!(photo_id = %photo.id, error = %e, "Could not load named faces, storing faces as unidentified");
                Vec::new()
            }
        };

        for (index, face) in detected.iter().enumerate() {
            match self.store_face(photo, index, face, &named).await {
                Ok(identified) => {
                    summary.stored += 1;
                    if identified {
                        summary.identified += 1;
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(photo_id = %photo.id, face_index = index, error = %e, "Skipping face");
                }
            }
        }
    }

    async fn store_face(
        &self,
        photo: &Photo,
        index: usize,
        face: &DetectedFace,
        named: &[NamedDescriptor],
    ) -> Result<bool, FaceProcessingError> {
        if face.descriptor.is_empty() || face.descriptor.iter().any(|v| !v.is_finite()) {
            return Err(FaceProcessingError::InvalidDescriptor {
                index,
                reason: "empty or non-finite descriptor".into(),
            });
        }

        let matched = best_match(&face.descriptor, named, &self.face_match);
        let identified = matched.is_some();

        let profile = NewFaceProfile {
            photo_id: photo.id,
            user_id: photo.user_id,
            face_embedding: face.descriptor.clone(),
            face_name: matched.as_ref().map(|m| m.face_name.clone()),
            bbox: face.bbox,
            detection_confidence: face.confidence,
            metadata: FaceMetadata {
                attributes: face.attributes.clone(),
                match_similarity: matched.as_ref().map(|m| m.similarity),
            },
        };
        self.store.insert_face_profile(&profile).await?;
        Ok(identified)
    }

    async fn record_failure(&self, job: &ProcessingJob, error: &ProcessingError) -> Result<JobOutcome, StoreError> {
        let cause = error.to_string();

        if job.is_last_attempt() {
            let message = format!("Processing failed after {} retries: {}", job.max_retries, cause);
            self.store
                .update_job(job.id, &JobPatch::failed(job.max_retries, &message, Utc::now()))
                .await?;
            self.sync_photo_status(job.photo_id, ProcessingStatus::Failed).await?;

            metrics::counter!("photo_jobs_failed_total").increment(1);
            tracing::error!(job_id = %job.id, photo_id = %job.photo_id, error = %cause, "Job failed after max retries");
            return Ok(JobOutcome::Failed {
                retry_count: job.max_retries,
                error: message,
            });
        }

        let retry_count = job.retry_count + 1;
        self.store.update_job(job.id, &JobPatch::retry(retry_count, &cause)).await?;
        self.sync_photo_status(job.photo_id, ProcessingStatus::Queued).await?;

        metrics::counter!("photo_jobs_retried_total").increment(1);
        tracing::warn!(
            job_id = %job.id,
            retry_count = retry_count,
            max_retries = job.max_retries,
            error = %cause,
            "Job re-queued for retry"
        );
        Ok(JobOutcome::Retrying {
            retry_count,
            error: cause,
        })
    }

    /// Keep the photo's status in step with its job. A photo deleted while
    /// its job ran has nothing left to sync.
    async fn sync_photo_status(&self, photo_id: Uuid, status: ProcessingStatus) -> Result<(), StoreError> {
        match self.store.update_photo(photo_id, &PhotoPatch::status(status)).await {
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(photo_id = %photo_id, status = %status, "Photo vanished before status update");
                Ok(())
            }
            other => other,
        }
    }

    async fn continue_if_pending(&self, user_id: Uuid) -> Result<ContinuationStatus, StoreError> {
        let pending = self.store.count_pending_jobs(user_id).await?;
        if pending == 0 {
            tracing::info!(user_id = %user_id, "Queue drained");
            return Ok(ContinuationStatus::NotNeeded);
        }

        match schedule_with_retry(self.scheduler.as_ref(), user_id, &self.config.continuation).await {
            Ok(attempts) => {
                tracing::info!(user_id = %user_id, pending, attempts, "Scheduled continuation");
                Ok(ContinuationStatus::Scheduled { attempts })
            }
            Err(e) => {
                let released = self.store.release_processing_jobs(user_id).await?;
                tracing::error!(
                    user_id = %user_id,
                    pending,
                    released,
                    error = %e,
                    "Could not schedule continuation; queue waits for the next trigger"
                );
                Ok(ContinuationStatus::Failed { released })
            }
        }
    }
}
