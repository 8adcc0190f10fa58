use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use tokio::sync::mpsc;

use crate::app_state::AppState;
use crate::models::api::{RankRequest, RankResponse};

/// POST /api/v1/search/rank — rank raw similarity hits for a query.
///
/// The progress events of the run are returned alongside the results.
pub async fn rank_candidates(
    State(state): State<AppState>,
    Json(request): Json<RankRequest>,
) -> Result<Json<RankResponse>, StatusCode> {
    if let Err(e) = request.validate() {
        tracing::debug!(error = %e, "Rejected rank request");
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let RankRequest {
        query,
        candidates,
        verify,
    } = request;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let results = state.ranker.rank(&query, candidates, verify, Some(&tx)).await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    Ok(Json(RankResponse {
        query,
        results,
        events,
    }))
}
