use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics — Prometheus text exposition of queue and ranking metrics.
pub async fn prometheus_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the pipeline records.
pub fn describe_metrics() {
    metrics::describe_counter!("photo_jobs_enqueued_total", "Processing jobs created");
    metrics::describe_counter!("photo_jobs_claimed_total", "Pending jobs claimed by a worker");
    metrics::describe_counter!("photo_jobs_completed_total", "Jobs that finished successfully");
    metrics::describe_counter!("photo_jobs_retried_total", "Failed attempts put back in the queue");
    metrics::describe_counter!("photo_jobs_failed_total", "Jobs frozen at failed after exhausting retries");
    metrics::describe_counter!("photo_jobs_stale_reset_total", "Abandoned processing jobs reset to pending");
    metrics::describe_histogram!("photo_processing_seconds", "Duration of a successful job attempt");
    metrics::describe_counter!("face_profiles_inserted_total", "Face profiles stored by the worker");
    metrics::describe_histogram!("search_rank_seconds", "Time to rank one search result set");
    metrics::describe_counter!(
        "search_candidates_rejected_total",
        "Candidates dropped by vision verification"
    );
}
