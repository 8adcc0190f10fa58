use std::time::Duration;

use serde::Deserialize;

use crate::services::face_matcher::{FaceMatchConfig, DEFAULT_MATCH_THRESHOLD};
use crate::services::ranker::RankerConfig;
use crate::services::worker::{RetryPolicy, WorkerConfig};

/// Which service produces embeddings. Chosen once at startup.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Workers AI text embeddings of the caption only.
    WorkersAi,
    /// CLIP service, text and image vectors in one space.
    Clip,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the continuation queue
    pub redis_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// R2 bucket holding the photos. Without it only URL locations can be fetched.
    pub r2_bucket: Option<String>,
    pub r2_access_key: Option<String>,
    pub r2_secret_key: Option<String>,
    pub r2_endpoint: Option<String>,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,

    /// Base URL of the CLIP service, required when `embedding_backend=clip`
    pub clip_endpoint: Option<String>,
    pub clip_api_token: Option<String>,

    #[serde(default)]
    pub face_detection_enabled: bool,

    /// Base URL of the face detection service
    pub face_service_url: Option<String>,

    #[serde(default = "default_face_match_threshold")]
    pub face_match_threshold: f32,

    /// Whether the search endpoint may run vision verification
    #[serde(default = "default_true")]
    pub vision_enabled: bool,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_vision_timeout_secs")]
    pub vision_timeout_secs: u64,

    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Bound on face detection and face inserts, after the caption is saved
    #[serde(default = "default_face_timeout_secs")]
    pub face_timeout_secs: u64,

    #[serde(default = "default_soft_deadline_secs")]
    pub soft_deadline_secs: u64,

    #[serde(default = "default_jobs_per_invocation")]
    pub jobs_per_invocation: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_continuation_attempts")]
    pub continuation_attempts: u32,

    #[serde(default = "default_continuation_backoff_ms")]
    pub continuation_backoff_ms: u64,

    /// Users processed concurrently by one worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Address for the worker's own Prometheus listener, if any
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::WorkersAi
}

fn default_face_match_threshold() -> f32 {
    DEFAULT_MATCH_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_vision_timeout_secs() -> u64 {
    30
}

fn default_stale_timeout_secs() -> u64 {
    300
}

fn default_job_timeout_secs() -> u64 {
    120
}

fn default_face_timeout_secs() -> u64 {
    60
}

fn default_soft_deadline_secs() -> u64 {
    270
}

fn default_jobs_per_invocation() -> usize {
    1
}

fn default_max_retries() -> i32 {
    crate::models::job::DEFAULT_MAX_RETRIES
}

fn default_continuation_attempts() -> u32 {
    3
}

fn default_continuation_backoff_ms() -> u64 {
    200
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("{0} must be set when {1}")]
    Missing(&'static str, &'static str),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Storage client error: {0}")]
    Storage(#[from] crate::services::storage::FetchError),

    #[error("Queue client error: {0}")]
    Queue(#[from] crate::services::queue::QueueError),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_backend == EmbeddingBackend::Clip && self.clip_endpoint.is_none() {
            return Err(ConfigError::Missing("CLIP_ENDPOINT", "EMBEDDING_BACKEND=clip"));
        }
        if self.face_detection_enabled && self.face_service_url.is_none() {
            return Err(ConfigError::Missing("FACE_SERVICE_URL", "FACE_DETECTION_ENABLED=true"));
        }
        if !(-1.0..=1.0).contains(&self.face_match_threshold) {
            return Err(ConfigError::Invalid {
                name: "FACE_MATCH_THRESHOLD",
                reason: "must be a cosine similarity between -1 and 1".into(),
            });
        }
        if self.max_retries < 1 {
            return Err(ConfigError::Invalid {
                name: "MAX_RETRIES",
                reason: "must be at least 1".into(),
            });
        }
        if self.job_timeout_secs > self.soft_deadline_secs {
            return Err(ConfigError::Invalid {
                name: "JOB_TIMEOUT_SECS",
                reason: "must not exceed SOFT_DEADLINE_SECS".into(),
            });
        }
        if self.face_detection_enabled && self.job_timeout_secs + self.face_timeout_secs > self.soft_deadline_secs {
            return Err(ConfigError::Invalid {
                name: "FACE_TIMEOUT_SECS",
                reason: "JOB_TIMEOUT_SECS + FACE_TIMEOUT_SECS must not exceed SOFT_DEADLINE_SECS".into(),
            });
        }
        Ok(())
    }

    /// R2 credentials, when all four settings are present.
    pub fn r2_settings(&self) -> Option<(&str, &str, &str, &str)> {
        Some((
            self.r2_bucket.as_deref()?,
            self.r2_endpoint.as_deref()?,
            self.r2_access_key.as_deref()?,
            self.r2_secret_key.as_deref()?,
        ))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            stale_timeout: Duration::from_secs(self.stale_timeout_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            face_timeout: Duration::from_secs(self.face_timeout_secs),
            soft_deadline: Duration::from_secs(self.soft_deadline_secs),
            jobs_per_invocation: self.jobs_per_invocation.max(1),
            max_retries: self.max_retries,
            continuation: self.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.continuation_attempts.max(1),
            base_delay: Duration::from_millis(self.continuation_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn ranker_config(&self) -> RankerConfig {
        RankerConfig {
            verify_timeout: Duration::from_secs(self.vision_timeout_secs),
            ..RankerConfig::default()
        }
    }

    pub fn face_match_config(&self) -> FaceMatchConfig {
        FaceMatchConfig {
            threshold: self.face_match_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut vars = vec![
            ("DATABASE_URL", "postgres://localhost/photos"),
            ("REDIS_URL", "redis://localhost"),
            ("CF_ACCOUNT_ID", "acct"),
            ("CF_API_TOKEN", "token"),
        ];
        vars.extend_from_slice(extra);
        vars.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = envy::from_iter(vars(&[])).unwrap();
        config.validate().unwrap();

        assert_eq!(config.embedding_backend, EmbeddingBackend::WorkersAi);
        assert!(!config.face_detection_enabled);
        assert!(config.vision_enabled);
        assert!(config.r2_settings().is_none());

        let worker = config.worker_config();
        assert_eq!(worker.stale_timeout, Duration::from_secs(300));
        assert_eq!(worker.face_timeout, Duration::from_secs(60));
        assert_eq!(worker.jobs_per_invocation, 1);
        assert_eq!(worker.max_retries, 3);
        assert_eq!(worker.continuation.attempts, 3);
        assert_eq!(worker.continuation.base_delay, Duration::from_millis(200));
        assert_eq!(config.face_match_config().threshold, DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_clip_backend_needs_endpoint() {
        let config: AppConfig = envy::from_iter(vars(&[("EMBEDDING_BACKEND", "clip")])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("CLIP_ENDPOINT", _))));

        let config: AppConfig = envy::from_iter(vars(&[
            ("EMBEDDING_BACKEND", "clip"),
            ("CLIP_ENDPOINT", "http://clip:7860"),
        ]))
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_job_timeout_must_fit_deadline() {
        let config: AppConfig = envy::from_iter(vars(&[
            ("JOB_TIMEOUT_SECS", "600"),
            ("SOFT_DEADLINE_SECS", "60"),
        ]))
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { name: "JOB_TIMEOUT_SECS", .. })));
    }

    #[test]
    fn test_face_phase_must_fit_deadline() {
        let config: AppConfig = envy::from_iter(vars(&[
            ("FACE_DETECTION_ENABLED", "true"),
            ("FACE_SERVICE_URL", "http://faces:8000"),
            ("JOB_TIMEOUT_SECS", "200"),
            ("FACE_TIMEOUT_SECS", "100"),
        ]))
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { name: "FACE_TIMEOUT_SECS", .. })));

        // Without face detection the face bound is irrelevant.
        let config: AppConfig = envy::from_iter(vars(&[
            ("JOB_TIMEOUT_SECS", "200"),
            ("FACE_TIMEOUT_SECS", "100"),
        ]))
        .unwrap();
        assert!(config.validate().is_ok());
    }
}
