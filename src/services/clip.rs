use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::services::gateway::{EmbeddingProvider, ProviderError};

/// ViT-B/32 output size.
pub const CLIP_DIMENSIONS: usize = 512;

/// Client for a self-hosted CLIP inference service. Text and image vectors
/// live in one space, so caption and image embeddings are comparable.
pub struct ClipClient {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    image: String,
    mime_type: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
    dimensions: usize,
}

impl ClipClient {
    pub fn new(endpoint: &str, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
        }
    }

    async fn embed<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<Vec<f32>, ProviderError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.endpoint, path))
            .json(body);
        if let Some(ref token) = self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        if parsed.dimensions != parsed.embedding.len() {
            return Err(ProviderError::Malformed(format!(
                "service reported {} dimensions but sent {}",
                parsed.dimensions,
                parsed.embedding.len()
            )));
        }
        Ok(parsed.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for ClipClient {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn dimensions(&self) -> usize {
        CLIP_DIMENSIONS
    }

    fn supports_image_embedding(&self) -> bool {
        true
    }

    async fn generate_text_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed("/embed/text", &TextRequest { text }).await
    }

    async fn generate_image_embedding(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        let request = ImageRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
            mime_type,
        };
        self.embed("/embed/image", &request).await
    }
}
