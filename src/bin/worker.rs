use metrics_exporter_prometheus::PrometheusBuilder;
use photo_pipeline::{
    app_state::{build_photo_storage, build_worker},
    config::AppConfig,
    db::{self, JobStore, PgStore},
    routes::metrics::describe_metrics,
    services::{queue::ContinuationQueue, worker::QueueWorker, workers_ai::WorkersAiClient},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Users with an invocation running in this process. The flag records that
/// another trigger arrived meanwhile and the user should be run again.
type InFlight = Arc<Mutex<HashMap<Uuid, bool>>>;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting photo processing worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Optional Prometheus listener
    if let Some(ref addr) = config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to start Prometheus listener");
        describe_metrics();
        tracing::info!(%addr, "Serving worker metrics");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let store: Arc<dyn JobStore> = Arc::new(PgStore::new(db_pool));
    let queue = Arc::new(ContinuationQueue::new(&config.redis_url).expect("Failed to initialize continuation queue"));
    let storage = Arc::new(build_photo_storage(&config).expect("Failed to initialize photo storage"));
    let workers_ai = Arc::new(WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token));
    let worker = Arc::new(build_worker(&config, store, storage, queue.clone(), workers_ai));

    // Concurrency cap and per-user dedupe
    let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    tracing::info!(
        concurrency = config.worker_concurrency,
        jobs_per_invocation = config.jobs_per_invocation,
        "Worker ready, waiting for invocations"
    );

    // Main processing loop
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested; abandoned jobs recover through the stale reset");
                break;
            }
            next = queue.dequeue() => match next {
                Ok(Some(continuation)) => {
                    let user_id = continuation.user_id;
                    // Already running here: ask for one more pass instead
                    if !mark_in_flight(&in_flight, user_id) {
                        tracing::debug!(user_id = %user_id, "User already running, rerun requested");
                        continue;
                    }

                    let permit = match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    tokio::spawn(drain_user(worker.clone(), in_flight.clone(), user_id, permit));
                }
                Ok(None) => {
                    // No invocation queued, sleep before next poll
                    tracing::trace!("No invocations queued, sleeping");
                    sleep(poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read continuation queue");
                    sleep(poll_interval).await;
                }
            }
        }
    }
}

/// Returns false when the user already has an invocation in this process.
fn mark_in_flight(in_flight: &InFlight, user_id: Uuid) -> bool {
    let mut users = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    match users.get_mut(&user_id) {
        Some(rerun) => {
            *rerun = true;
            false
        }
        None => {
            users.insert(user_id, false);
            true
        }
    }
}

async fn drain_user(worker: Arc<QueueWorker>, in_flight: InFlight, user_id: Uuid, _permit: OwnedSemaphorePermit) {
    loop {
        match worker.run(user_id).await {
            Ok(report) => tracing::info!(
                user_id = %user_id,
                jobs = report.jobs.len(),
                continuation = ?report.continuation,
                "Invocation finished"
            ),
            Err(e) => tracing::error!(user_id = %user_id, error = %e, "Invocation aborted by store error"),
        }

        // Run again if another trigger arrived meanwhile
        let rerun = {
            let mut users = in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match users.get_mut(&user_id) {
                Some(rerun) if *rerun => {
                    *rerun = false;
                    true
                }
                _ => {
                    users.remove(&user_id);
                    false
                }
            }
        };
        if !rerun {
            break;
        }
    }
}
