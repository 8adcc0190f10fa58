use std::time::Duration;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Reads the bytes of a stored photo.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// `location` is either an object key in the photo bucket or an
    /// absolute http(s) URL.
    async fn fetch_image_bytes(&self, location: &str) -> Result<Vec<u8>, FetchError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| FetchError::Config(e.to_string()))?;

        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| FetchError::Config(e.to_string()))?;
        bucket.set_request_timeout(Some(timeout));

        Ok(Self { bucket })
    }

    /// Download photo bytes from R2.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.bucket.get_object(key).await.map_err(FetchError::S3)?;
        if response.status_code() != 200 {
            return Err(FetchError::Status {
                location: key.to_string(),
                status: response.status_code(),
            });
        }
        Ok(response.to_vec())
    }
}

/// Fetches photos from the bucket by key, or over HTTP when the stored
/// location is already a URL (public/signed URLs, imported photos).
pub struct PhotoStorage {
    r2: Option<R2Client>,
    http: reqwest::Client,
    timeout: Duration,
}

impl PhotoStorage {
    pub fn new(r2: Option<R2Client>, timeout: Duration) -> Self {
        Self {
            r2,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest(url, e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                location: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest(url, e, self.timeout))?;
        Ok(bytes.to_vec())
    }
}

fn classify_reqwest(location: &str, e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            location: location.to_string(),
            timeout,
        }
    } else {
        FetchError::Http(e)
    }
}

#[async_trait]
impl ImageFetcher for PhotoStorage {
    async fn fetch_image_bytes(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            return self.fetch_url(location).await;
        }

        let r2 = self.r2.as_ref().ok_or_else(|| {
            FetchError::Config(format!("no bucket configured for object key '{}'", location))
        })?;

        match tokio::time::timeout(self.timeout, r2.download(location)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                location: location.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Best-effort MIME type for image bytes, falling back to the stored value
/// and then to JPEG.
pub fn detect_mime_type(bytes: &[u8], stored: Option<&str>) -> String {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) => stored.unwrap_or("image/jpeg").to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fetching {location} returned status {status}")]
    Status { location: String, status: u16 },

    #[error("Fetching {location} timed out after {timeout:?}")]
    Timeout { location: String, timeout: Duration },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
