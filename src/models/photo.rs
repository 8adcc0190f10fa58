use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Photo-side mirror of the job lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingStatus {
    Uploaded,
    Queued,
    Processing,
    Completed,
    Failed,
}

/// The columns of a photo this service reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Object key in the photo bucket, or an absolute http(s) URL.
    pub storage_path: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub processing_status: ProcessingStatus,
    pub caption: Option<String>,
    /// Caption/text-space vector.
    pub embedding: Option<Vec<f32>>,
    /// Image-space vector, only written by multimodal providers.
    pub embedding_alt: Option<Vec<f32>>,
    pub is_favorite: bool,
    pub taken_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoPatch {
    pub processing_status: Option<ProcessingStatus>,
    pub caption: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_alt: Option<Vec<f32>>,
}

impl PhotoPatch {
    pub fn status(status: ProcessingStatus) -> Self {
        Self {
            processing_status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, photo: &mut Photo) {
        if let Some(status) = self.processing_status {
            photo.processing_status = status;
        }
        if let Some(ref caption) = self.caption {
            photo.caption = Some(caption.clone());
        }
        if let Some(ref embedding) = self.embedding {
            photo.embedding = Some(embedding.clone());
        }
        if let Some(ref embedding_alt) = self.embedding_alt {
            photo.embedding_alt = Some(embedding_alt.clone());
        }
    }
}
