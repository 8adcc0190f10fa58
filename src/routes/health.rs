use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub embedding_provider: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    /// Worker invocations waiting in the continuation queue.
    pub queued_invocations: Option<u64>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_result<T, E: std::fmt::Display>(component: &str, result: Result<T, E>, start: Instant) -> Self {
        match result {
            Ok(_) => Self {
                status: "ok",
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(component, error = %e, "Health check failed");
                Self {
                    status: "error",
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health — database and Redis reachability.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let database = ComponentHealth::from_result(
        "database",
        sqlx::query("SELECT 1").execute(&state.db).await,
        start,
    );

    let start = Instant::now();
    let redis = ComponentHealth::from_result("redis", state.queue.health_check().await, start);
    let queued_invocations = if redis.is_ok() {
        state.queue.queue_depth().await.ok()
    } else {
        None
    };

    let healthy = database.is_ok() && redis.is_ok();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        embedding_provider: state.worker.provider_name(),
        checks: HealthChecks {
            database,
            redis,
            queued_invocations,
        },
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}
