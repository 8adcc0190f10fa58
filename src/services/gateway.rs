//! Embedding/Caption Gateway.
//!
//! Captioning and embedding are separate provider seams. The embedding
//! provider is picked once at startup and advertises whether it can embed
//! images into the same space as text; the pipeline never branches on a
//! provider name.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Produces a natural-language caption for an image.
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn generate_caption(&self, image: &[u8], mime_type: &str)
        -> Result<String, ProviderError>;
}

/// Produces fixed-dimension vectors for text, and optionally for images.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// True when image vectors share the text vector space.
    fn supports_image_embedding(&self) -> bool {
        false
    }

    async fn generate_text_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    async fn generate_image_embedding(
        &self,
        _image: &[u8],
        _mime_type: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unsupported("image embedding"))
    }
}

/// Everything the pipeline stores on a photo after a successful gateway call.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoAnalysis {
    pub caption: String,
    pub embedding: Vec<f32>,
    pub embedding_alt: Option<Vec<f32>>,
}

pub struct EmbeddingGateway {
    captioner: Arc<dyn Captioner>,
    embeddings: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
}

impl EmbeddingGateway {
    pub fn new(
        captioner: Arc<dyn Captioner>,
        embeddings: Arc<dyn EmbeddingProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            captioner,
            embeddings,
            timeout,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.embeddings.name()
    }

    /// Caption the image and embed it. The caption is mandatory: it is both
    /// what the user sees and the input to the caption-space vector.
    pub async fn analyze(&self, image: &[u8], mime_type: &str) -> Result<PhotoAnalysis, ProviderError> {
        let caption = with_timeout(
            "caption",
            self.timeout,
            self.captioner.generate_caption(image, mime_type),
        )
        .await?;
        let caption = caption.trim().to_string();
        if caption.is_empty() {
            return Err(ProviderError::MissingCaption);
        }

        let embedding = with_timeout(
            "text embedding",
            self.timeout,
            self.embeddings.generate_text_embedding(&caption),
        )
        .await?;
        self.check_dimensions(&embedding)?;

        let embedding_alt = if self.embeddings.supports_image_embedding() {
            let vector = with_timeout(
                "image embedding",
                self.timeout,
                self.embeddings.generate_image_embedding(image, mime_type),
            )
            .await?;
            self.check_dimensions(&vector)?;
            Some(vector)
        } else {
            None
        };

        Ok(PhotoAnalysis {
            caption,
            embedding,
            embedding_alt,
        })
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), ProviderError> {
        let expected = self.embeddings.dimensions();
        if vector.len() != expected {
            return Err(ProviderError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ProviderError::Malformed("embedding contains non-finite values".into()));
        }
        Ok(())
    }
}

/// Bound a provider call, mapping elapsed deadlines to `ProviderError::Timeout`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { operation, timeout }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{operation} call timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Provider returned an empty caption")]
    MissingCaption,

    #[error("Expected a {expected}-dimension vector, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Provider does not support {0}")]
    Unsupported(&'static str),
}
