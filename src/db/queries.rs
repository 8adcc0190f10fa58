use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::face::{NamedDescriptor, NewFaceProfile};
use crate::models::job::{JobPatch, JobStatus, NewJob, ProcessingJob};
use crate::models::photo::{Photo, PhotoPatch, ProcessingStatus};

const JOB_COLUMNS: &str = "id, seq, photo_id, user_id, status, retry_count, max_retries, priority, \
     created_at, processing_started_at, processing_completed_at, error_message";

const UNIQUE_VIOLATION: &str = "23505";

fn job_from_row(row: &PgRow) -> Result<ProcessingJob, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status)
        .map_err(|_| StoreError::InvalidColumn(format!("job status '{}'", status)))?;

    Ok(ProcessingJob {
        id: row.try_get("id")?,
        photo_id: row.try_get("photo_id")?,
        user_id: row.try_get("user_id")?,
        status,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        seq: row.try_get("seq")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_completed_at: row.try_get("processing_completed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn photo_from_row(row: &PgRow) -> Result<Photo, StoreError> {
    let status: String = row.try_get("processing_status")?;
    let processing_status = ProcessingStatus::from_str(&status)
        .map_err(|_| StoreError::InvalidColumn(format!("photo status '{}'", status)))?;

    Ok(Photo {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        storage_path: row.try_get("storage_path")?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        processing_status,
        caption: row.try_get("caption")?,
        embedding: row.try_get("embedding")?,
        embedding_alt: row.try_get("embedding_alt")?,
        is_favorite: row.try_get("is_favorite")?,
        taken_at: row.try_get("taken_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a new processing job and mark its photo as queued.
pub async fn create_job(pool: &PgPool, job: &NewJob) -> Result<ProcessingJob, StoreError> {
    let mut tx = pool.begin().await?;

    let photo_rows = sqlx::query(
        r#"
        UPDATE photos
        SET processing_status = 'queued', updated_at = NOW()
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(job.photo_id)
    .bind(job.user_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if photo_rows == 0 {
        return Err(StoreError::NotFound {
            entity: "photo",
            id: job.photo_id,
        });
    }

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO processing_jobs (photo_id, user_id, status, priority, max_retries)
        VALUES ($1, $2, 'pending', $3, $4)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.photo_id)
    .bind(job.user_id)
    .bind(job.priority)
    .bind(job.max_retries)
    .fetch_one(&mut *tx)
    .await?;

    let created = job_from_row(&row)?;
    tx.commit().await?;
    Ok(created)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ProcessingJob>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Reset abandoned `processing` jobs of a user back to `pending`.
pub async fn reset_stale_jobs(
    pool: &PgPool,
    user_id: Uuid,
    started_before: DateTime<Utc>,
    reason: &str,
) -> Result<Vec<ProcessingJob>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        WITH reset AS (
            UPDATE processing_jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                processing_started_at = NULL,
                error_message = $3
            WHERE user_id = $1
              AND status = 'processing'
              AND (processing_started_at IS NULL OR processing_started_at < $2)
            RETURNING {JOB_COLUMNS}
        ),
        requeued AS (
            UPDATE photos
            SET processing_status = 'queued', updated_at = NOW()
            WHERE id IN (SELECT photo_id FROM reset)
        )
        SELECT * FROM reset
        "#
    ))
    .bind(user_id)
    .bind(started_before)
    .bind(reason)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

pub async fn find_processing_job(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<ProcessingJob>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM processing_jobs
        WHERE user_id = $1 AND status = 'processing'
        ORDER BY processing_started_at ASC NULLS FIRST
        LIMIT 1
        "#
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Claim the next pending job for a user.
///
/// The `NOT EXISTS` guard and the partial unique index on
/// `(user_id) WHERE status = 'processing'` together make this the only way a
/// job can enter `processing`; losing the race surfaces as `Ok(None)`.
pub async fn claim_next_job(
    pool: &PgPool,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<ProcessingJob>, StoreError> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE processing_jobs
        SET status = 'processing',
            processing_started_at = $2
        WHERE id = (
            SELECT id
            FROM processing_jobs
            WHERE user_id = $1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC, seq ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        AND NOT EXISTS (
            SELECT 1 FROM processing_jobs
            WHERE user_id = $1 AND status = 'processing'
        )
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(now)
    .fetch_optional(pool)
    .await;

    match result {
        Ok(row) => row.as_ref().map(job_from_row).transpose(),
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            tracing::debug!(user_id = %user_id, "Claim lost to a concurrent worker");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn count_pending_jobs(pool: &PgPool, user_id: Uuid) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processing_jobs WHERE user_id = $1 AND status = 'pending'",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Apply a partial update to a job.
pub async fn update_job(pool: &PgPool, job_id: Uuid, patch: &JobPatch) -> Result<(), StoreError> {
    if *patch == JobPatch::default() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new("UPDATE processing_jobs SET ");
    let mut set = qb.separated(", ");
    if let Some(status) = patch.status {
        set.push("status = ").push_bind_unseparated(status.to_string());
    }
    if let Some(retry_count) = patch.retry_count {
        set.push("retry_count = ").push_bind_unseparated(retry_count);
    }
    if let Some(started) = patch.processing_started_at {
        set.push("processing_started_at = ").push_bind_unseparated(started);
    }
    if let Some(completed) = patch.processing_completed_at {
        set.push("processing_completed_at = ").push_bind_unseparated(completed);
    }
    if let Some(ref error) = patch.error_message {
        set.push("error_message = ").push_bind_unseparated(error.clone());
    }
    qb.push(" WHERE id = ").push_bind(job_id);

    let affected = qb.build().execute(pool).await?.rows_affected();
    if affected == 0 {
        return Err(StoreError::NotFound {
            entity: "job",
            id: job_id,
        });
    }
    Ok(())
}

/// Put every `processing` job of a user back to `pending`, keeping its retry count.
pub async fn release_processing_jobs(pool: &PgPool, user_id: Uuid) -> Result<u64, StoreError> {
    let rows = sqlx::query(
        r#"
        WITH released AS (
            UPDATE processing_jobs
            SET status = 'pending', processing_started_at = NULL
            WHERE user_id = $1 AND status = 'processing'
            RETURNING photo_id
        ),
        requeued AS (
            UPDATE photos
            SET processing_status = 'queued', updated_at = NOW()
            WHERE id IN (SELECT photo_id FROM released)
        )
        SELECT photo_id FROM released
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.len() as u64)
}

pub async fn get_photo(pool: &PgPool, photo_id: Uuid) -> Result<Option<Photo>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, storage_path, file_name, mime_type, processing_status,
               caption, embedding, embedding_alt, is_favorite, taken_at, created_at
        FROM photos
        WHERE id = $1
        "#,
    )
    .bind(photo_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(photo_from_row).transpose()
}

/// Apply a partial update to a photo.
pub async fn update_photo(
    pool: &PgPool,
    photo_id: Uuid,
    patch: &PhotoPatch,
) -> Result<(), StoreError> {
    if *patch == PhotoPatch::default() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new("UPDATE photos SET updated_at = NOW()");
    if let Some(status) = patch.processing_status {
        qb.push(", processing_status = ").push_bind(status.to_string());
    }
    if let Some(ref caption) = patch.caption {
        qb.push(", caption = ").push_bind(caption.clone());
    }
    if let Some(ref embedding) = patch.embedding {
        qb.push(", embedding = ").push_bind(embedding.clone());
    }
    if let Some(ref embedding_alt) = patch.embedding_alt {
        qb.push(", embedding_alt = ").push_bind(embedding_alt.clone());
    }
    qb.push(" WHERE id = ").push_bind(photo_id);

    let affected = qb.build().execute(pool).await?.rows_affected();
    if affected == 0 {
        return Err(StoreError::NotFound {
            entity: "photo",
            id: photo_id,
        });
    }
    Ok(())
}

pub async fn insert_face_profile(
    pool: &PgPool,
    profile: &NewFaceProfile,
) -> Result<Uuid, StoreError> {
    let metadata = serde_json::to_value(&profile.metadata)?;

    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO face_profiles (
            photo_id, user_id, face_embedding, face_name,
            bbox_x, bbox_y, bbox_width, bbox_height,
            detection_confidence, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(profile.photo_id)
    .bind(profile.user_id)
    .bind(&profile.face_embedding)
    .bind(profile.face_name.as_deref())
    .bind(profile.bbox.x)
    .bind(profile.bbox.y)
    .bind(profile.bbox.width)
    .bind(profile.bbox.height)
    .bind(profile.detection_confidence)
    .bind(metadata)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

pub async fn list_named_descriptors(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<NamedDescriptor>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, face_name, face_embedding
        FROM face_profiles
        WHERE user_id = $1 AND face_name IS NOT NULL
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(NamedDescriptor {
                profile_id: r.try_get("id")?,
                face_name: r.try_get("face_name")?,
                face_embedding: r.try_get("face_embedding")?,
            })
        })
        .collect()
}

/// `JobStore` backed by the PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, job: &NewJob) -> Result<ProcessingJob, StoreError> {
        create_job(&self.pool, job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, StoreError> {
        get_job(&self.pool, job_id).await
    }

    async fn reset_stale_jobs(
        &self,
        user_id: Uuid,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        reset_stale_jobs(&self.pool, user_id, started_before, reason).await
    }

    async fn find_processing_job(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ProcessingJob>, StoreError> {
        find_processing_job(&self.pool, user_id).await
    }

    async fn claim_next_job(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingJob>, StoreError> {
        claim_next_job(&self.pool, user_id, now).await
    }

    async fn count_pending_jobs(&self, user_id: Uuid) -> Result<i64, StoreError> {
        count_pending_jobs(&self.pool, user_id).await
    }

    async fn update_job(&self, job_id: Uuid, patch: &JobPatch) -> Result<(), StoreError> {
        update_job(&self.pool, job_id, patch).await
    }

    async fn release_processing_jobs(&self, user_id: Uuid) -> Result<u64, StoreError> {
        release_processing_jobs(&self.pool, user_id).await
    }

    async fn get_photo(&self, photo_id: Uuid) -> Result<Option<Photo>, StoreError> {
        get_photo(&self.pool, photo_id).await
    }

    async fn update_photo(&self, photo_id: Uuid, patch: &PhotoPatch) -> Result<(), StoreError> {
        update_photo(&self.pool, photo_id, patch).await
    }

    async fn insert_face_profile(&self, profile: &NewFaceProfile) -> Result<Uuid, StoreError> {
        insert_face_profile(&self.pool, profile).await
    }

    async fn list_named_descriptors(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<NamedDescriptor>, StoreError> {
        list_named_descriptors(&self.pool, user_id).await
    }
}
