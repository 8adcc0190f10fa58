use sqlx::PgPool;
use std::sync::Arc;

use crate::config::{AppConfig, ConfigError, EmbeddingBackend};
use crate::db::{JobStore, PgStore};
use crate::services::{
    clip::ClipClient,
    faces::FaceServiceClient,
    gateway::{EmbeddingGateway, EmbeddingProvider},
    queue::{ContinuationQueue, ContinuationScheduler},
    ranker::Ranker,
    storage::{ImageFetcher, PhotoStorage, R2Client},
    vision::VisionJudge,
    worker::{QueueWorker, RetryPolicy},
    workers_ai::WorkersAiClient,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<ContinuationQueue>,
    pub worker: Arc<QueueWorker>,
    pub ranker: Arc<Ranker>,
    pub retry_policy: RetryPolicy,
}

impl AppState {
    pub fn from_config(config: &AppConfig, db: PgPool) -> Result<Self, ConfigError> {
        let store: Arc<dyn JobStore> = Arc::new(PgStore::new(db.clone()));
        let queue = Arc::new(ContinuationQueue::new(&config.redis_url)?);
        let storage: Arc<dyn ImageFetcher> = Arc::new(build_photo_storage(config)?);
        let workers_ai = Arc::new(WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token));

        let worker = build_worker(config, store.clone(), storage.clone(), queue.clone(), workers_ai.clone());
        let judge: Option<Arc<dyn VisionJudge>> = if config.vision_enabled {
            Some(workers_ai)
        } else {
            None
        };
        let ranker = Ranker::new(config.ranker_config(), judge, storage);

        Ok(Self {
            db,
            store,
            queue,
            worker: Arc::new(worker),
            ranker: Arc::new(ranker),
            retry_policy: config.retry_policy(),
        })
    }
}

/// Photo fetcher: R2 when configured, plain HTTP otherwise.
pub fn build_photo_storage(config: &AppConfig) -> Result<PhotoStorage, ConfigError> {
    let r2 = match config.r2_settings() {
        Some((bucket, endpoint, access_key, secret_key)) => Some(R2Client::new(
            bucket,
            endpoint,
            access_key,
            secret_key,
            config.fetch_timeout(),
        )?),
        None => {
            tracing::warn!("R2 settings incomplete, only URL photo locations can be fetched");
            None
        }
    };
    Ok(PhotoStorage::new(r2, config.fetch_timeout()))
}

/// Assemble the queue worker with the configured embedding backend and,
/// if enabled, face detection.
pub fn build_worker(
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn ImageFetcher>,
    scheduler: Arc<dyn ContinuationScheduler>,
    workers_ai: Arc<WorkersAiClient>,
) -> QueueWorker {
    let embeddings: Arc<dyn EmbeddingProvider> = match (config.embedding_backend, config.clip_endpoint.as_deref()) {
        (EmbeddingBackend::Clip, Some(endpoint)) => {
            Arc::new(ClipClient::new(endpoint, config.clip_api_token.clone()))
        }
        _ => workers_ai.clone(),
    };
    tracing::info!(provider = embeddings.name(), dimensions = embeddings.dimensions(), "Embedding provider selected");

    let gateway = EmbeddingGateway::new(workers_ai, embeddings, config.provider_timeout());
    let worker = QueueWorker::new(store, fetcher, Arc::new(gateway), scheduler, config.worker_config());

    match (config.face_detection_enabled, config.face_service_url.as_deref()) {
        (true, Some(url)) => {
            tracing::info!(face_service = %url, "Face detection enabled");
            worker.with_face_detection(
                Arc::new(FaceServiceClient::new(url, config.provider_timeout())),
                config.face_match_config(),
            )
        }
        _ => worker,
    }
}
