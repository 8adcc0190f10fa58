use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "photo_pipeline:continuations";

/// Hands "this user has more work" to whatever runs the next worker
/// invocation.
#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    async fn schedule(&self, user_id: Uuid) -> Result<(), QueueError>;
}

/// Continuation payload serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Continuation {
    pub user_id: Uuid,
}

/// Redis list of pending worker invocations, consumed by the worker binary.
pub struct ContinuationQueue {
    client: redis::Client,
}

impl ContinuationQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    pub async fn enqueue(&self, continuation: &Continuation) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(continuation).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Pop the oldest continuation, if any.
    pub async fn dequeue(&self) -> Result<Option<Continuation>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = conn.rpop(QUEUE_KEY, None).await.map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let continuation: Continuation =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(continuation))
            }
            None => Ok(None),
        }
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Number of invocations waiting to run.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[async_trait]
impl ContinuationScheduler for ContinuationQueue {
    async fn schedule(&self, user_id: Uuid) -> Result<(), QueueError> {
        self.enqueue(&Continuation { user_id }).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}
