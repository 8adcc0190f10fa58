//! In-process `JobStore` used by tests and local runs without PostgreSQL.
//!
//! State sits behind one mutex so each trait call is a single atomic step,
//! which is the same granularity the SQL statements give.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::face::{NamedDescriptor, NewFaceProfile};
use crate::models::job::{JobPatch, JobStatus, NewJob, ProcessingJob};
use crate::models::photo::{Photo, PhotoPatch, ProcessingStatus};

#[derive(Default)]
struct State {
    jobs: Vec<ProcessingJob>,
    photos: HashMap<Uuid, Photo>,
    faces: Vec<(Uuid, NewFaceProfile)>,
    next_seq: i64,
}

impl State {
    fn set_photo_status(&mut self, photo_id: Uuid, status: ProcessingStatus) {
        if let Some(photo) = self.photos.get_mut(&photo_id) {
            photo.processing_status = status;
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update; keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_photo(&self, photo: Photo) {
        self.lock().photos.insert(photo.id, photo);
    }

    pub fn photo(&self, photo_id: Uuid) -> Option<Photo> {
        self.lock().photos.get(&photo_id).cloned()
    }

    pub fn job(&self, job_id: Uuid) -> Option<ProcessingJob> {
        self.lock().jobs.iter().find(|j| j.id == job_id).cloned()
    }

    pub fn jobs_for_user(&self, user_id: Uuid) -> Vec<ProcessingJob> {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn face_profiles(&self, photo_id: Uuid) -> Vec<NewFaceProfile> {
        self.lock()
            .faces
            .iter()
            .filter(|(_, f)| f.photo_id == photo_id)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Overwrite a stored job, e.g. to simulate a worker that died mid-job.
    pub fn put_job(&self, job: ProcessingJob) {
        let mut state = self.lock();
        match state.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => state.jobs.push(job),
        }
    }

    /// Seed a named face profile that the matcher can find.
    pub fn insert_named_face(&self, profile: NewFaceProfile) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().faces.push((id, profile));
        id
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &NewJob) -> Result<ProcessingJob, StoreError> {
        let mut state = self.lock();
        match state.photos.get_mut(&job.photo_id) {
            Some(photo) if photo.user_id == job.user_id => {
                photo.processing_status = ProcessingStatus::Queued;
            }
            _ => {
                return Err(StoreError::NotFound {
                    entity: "photo",
                    id: job.photo_id,
                })
            }
        }

        state.next_seq += 1;
        let created = ProcessingJob {
            id: Uuid::new_v4(),
            photo_id: job.photo_id,
            user_id: job.user_id,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: job.max_retries,
            priority: job.priority,
            created_at: Utc::now(),
            seq: state.next_seq,
            processing_started_at: None,
            processing_completed_at: None,
            error_message: None,
        };
        state.jobs.push(created.clone());
        Ok(created)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, StoreError> {
        Ok(self.job(job_id))
    }

    async fn reset_stale_jobs(
        &self,
        user_id: Uuid,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        let mut state = self.lock();
        let mut reset = Vec::new();
        for job in state.jobs.iter_mut() {
            let stale = job.user_id == user_id
                && job.status == JobStatus::Processing
                && job.processing_started_at.map_or(true, |t| t < started_before);
            if stale {
                JobPatch::retry(job.retry_count + 1, reason).apply(job);
                reset.push(job.clone());
            }
        }
        for job in &reset {
            state.set_photo_status(job.photo_id, ProcessingStatus::Queued);
        }
        Ok(reset)
    }

    async fn find_processing_job(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ProcessingJob>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .find(|j| j.user_id == user_id && j.status == JobStatus::Processing)
            .cloned())
    }

    async fn claim_next_job(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingJob>, StoreError> {
        let mut state = self.lock();
        let busy = state
            .jobs
            .iter()
            .any(|j| j.user_id == user_id && j.status == JobStatus::Processing);
        if busy {
            return Ok(None);
        }

        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.user_id == user_id && j.status == JobStatus::Pending)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.seq.cmp(&b.seq))
            });

        Ok(next.map(|job| {
            job.status = JobStatus::Processing;
            job.processing_started_at = Some(now);
            job.clone()
        }))
    }

    async fn count_pending_jobs(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.user_id == user_id && j.status == JobStatus::Pending)
            .count() as i64)
    }

    async fn update_job(&self, job_id: Uuid, patch: &JobPatch) -> Result<(), StoreError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(StoreError::NotFound {
                entity: "job",
                id: job_id,
            })?;
        patch.apply(job);
        Ok(())
    }

    async fn release_processing_jobs(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let mut photos = Vec::new();
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.user_id == user_id && j.status == JobStatus::Processing)
        {
            JobPatch::released().apply(job);
            photos.push(job.photo_id);
        }
        for photo_id in &photos {
            state.set_photo_status(*photo_id, ProcessingStatus::Queued);
        }
        Ok(photos.len() as u64)
    }

    async fn get_photo(&self, photo_id: Uuid) -> Result<Option<Photo>, StoreError> {
        Ok(self.photo(photo_id))
    }

    async fn update_photo(&self, photo_id: Uuid, patch: &PhotoPatch) -> Result<(), StoreError> {
        let mut state = self.lock();
        let photo = state.photos.get_mut(&photo_id).ok_or(StoreError::NotFound {
            entity: "photo",
            id: photo_id,
        })?;
        patch.apply(photo);
        Ok(())
    }

    async fn insert_face_profile(&self, profile: &NewFaceProfile) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.lock().faces.push((id, profile.clone()));
        Ok(id)
    }

    async fn list_named_descriptors(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<NamedDescriptor>, StoreError> {
        Ok(self
            .lock()
            .faces
            .iter()
            .filter(|(_, f)| f.user_id == user_id)
            .filter_map(|(id, f)| {
                f.face_name.as_ref().map(|name| NamedDescriptor {
                    profile_id: *id,
                    face_name: name.clone(),
                    face_embedding: f.face_embedding.clone(),
                })
            })
            .collect())
    }
}
