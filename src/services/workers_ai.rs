use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::search::MatchVerdict;
use crate::services::gateway::{Captioner, EmbeddingProvider, ProviderError};
use crate::services::vision::{parse_verdict, verification_prompt, VisionJudge};

const LLAVA_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";
const BGE_MODEL: &str = "@cf/baai/bge-base-en-v1.5";
const BGE_DIMENSIONS: usize = 768;

const CAPTION_PROMPT: &str = concat!(
    "Describe this photo in one or two sentences for a photo album search index. ",
    "Mention the main subjects, setting, activities, notable objects and colors. ",
    "Do not speculate about names."
);

/// Client for Cloudflare Workers AI: LLaVA for captions and vision
/// verification, BGE for caption-space text embeddings.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Serialize)]
struct LlavaRequest<'a> {
    image: &'a [u8],
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

#[derive(Serialize)]
struct BgeRequest<'a> {
    text: [&'a str; 1],
}

#[derive(Deserialize)]
struct BgeResult {
    data: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Self {
        Self {
            http: Client::new(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        }
    }

    async fn run<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        model: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.result)
    }

    async fn describe(&self, image: &[u8], prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        let result: LlavaResult = self
            .run(
                LLAVA_MODEL,
                &LlavaRequest {
                    image,
                    prompt,
                    max_tokens,
                },
            )
            .await?;
        Ok(result.description)
    }
}

#[async_trait]
impl Captioner for WorkersAiClient {
    async fn generate_caption(&self, image: &[u8], _mime_type: &str) -> Result<String, ProviderError> {
        self.describe(image, CAPTION_PROMPT, 160).await
    }
}

#[async_trait]
impl EmbeddingProvider for WorkersAiClient {
    fn name(&self) -> &'static str {
        "workers_ai"
    }

    fn dimensions(&self) -> usize {
        BGE_DIMENSIONS
    }

    async fn generate_text_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let result: BgeResult = self.run(BGE_MODEL, &BgeRequest { text: [text] }).await?;
        result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("embedding response had no vectors".into()))
    }
}

#[async_trait]
impl VisionJudge for WorkersAiClient {
    async fn evaluate_image_match(
        &self,
        image: &[u8],
        _mime_type: &str,
        query: &str,
    ) -> Result<MatchVerdict, ProviderError> {
        let answer = self.describe(image, &verification_prompt(query), 256).await?;
        parse_verdict(&answer)
    }
}
