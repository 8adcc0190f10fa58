use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::db::store::StoreError;
use crate::models::face::DetectedFace;

/// Face Gateway: finds faces in an image and describes each one.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<DetectedFace>, FaceProcessingError>;
}

/// HTTP client for the face detection service. The service takes a base64
/// image and answers with one entry per face: box, score, 128-d descriptor
/// and age/gender/expression estimates.
pub struct FaceServiceClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct DetectRequest {
    image: String,
}

#[derive(Deserialize)]
struct DetectResponse {
    faces: Vec<DetectedFace>,
}

impl FaceServiceClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl FaceDetector for FaceServiceClient {
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<DetectedFace>, FaceProcessingError> {
        let request = DetectRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
        };

        let response = self
            .http
            .post(format!("{}/detect", self.endpoint))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(FaceProcessingError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FaceProcessingError::Detection(format!(
                "face service returned status {}",
                status
            )));
        }

        let parsed: DetectResponse = response.json().await.map_err(FaceProcessingError::Http)?;
        Ok(parsed.faces)
    }
}

/// Failures scoped to face work. These are logged and never fail a job.
#[derive(Debug, thiserror::Error)]
pub enum FaceProcessingError {
    #[error("Face service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Face detection failed: {0}")]
    Detection(String),

    #[error("Face {index} has an invalid descriptor: {reason}")]
    InvalidDescriptor { index: usize, reason: String },

    #[error("Failed to store face profile: {0}")]
    Store(#[from] StoreError),
}
