use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::StoreError;
use crate::models::api::{EnqueueJobRequest, EnqueueJobResponse, JobStatusResponse, ProcessResponse};
use crate::services::worker::schedule_with_retry;

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Ask the worker process to run an invocation for the user. Failure here is
/// not fatal: the job stays `pending` and the next trigger picks it up.
async fn schedule(state: &AppState, user_id: Uuid) -> bool {
    match schedule_with_retry(state.queue.as_ref(), user_id, &state.retry_policy).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Worker invocation not scheduled");
            false
        }
    }
}

/// POST /api/v1/jobs — queue processing for a saved photo.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueJobRequest>,
) -> Result<(StatusCode, Json<EnqueueJobResponse>), StatusCode> {
    if let Err(e) = request.validate() {
        tracing::debug!(error = %e, "Rejected enqueue request");
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let job = state
        .worker
        .enqueue(request.photo_id, request.user_id, request.priority.unwrap_or(0))
        .await
        .map_err(|e| {
            tracing::error!(photo_id = %request.photo_id, error = %e, "Failed to create job");
            store_status(&e)
        })?;

    let message = if schedule(&state, job.user_id).await {
        "Photo queued for processing"
    } else {
        "Photo queued; processing starts on the next trigger"
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueJobResponse {
            job_id: job.id,
            status: job.status.to_string(),
            message: message.to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — check processing job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = state.store.get_job(job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
        store_status(&e)
    })?;

    job.map(|job| Json(job.into())).ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/v1/users/{user_id}/process — trigger a worker invocation.
pub async fn trigger_processing(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> (StatusCode, Json<ProcessResponse>) {
    let scheduled = schedule(&state, user_id).await;
    let status = if scheduled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ProcessResponse { user_id, scheduled }))
}
