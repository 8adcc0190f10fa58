use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounding box of a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Soft attributes reported by the face service. These are guesses and are
/// stored as-is in the profile metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FaceAttributes {
    pub age: Option<f32>,
    pub gender: Option<String>,
    #[serde(default)]
    pub expressions: HashMap<String, f32>,
}

/// A face as returned by the Face Gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub descriptor: Vec<f32>,
    #[serde(flatten)]
    pub attributes: FaceAttributes,
}

/// Metadata blob persisted alongside a face profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceMetadata {
    #[serde(flatten)]
    pub attributes: FaceAttributes,
    /// Similarity of the identity match that produced `face_name`, if any.
    pub match_similarity: Option<f32>,
}

/// A face profile ready to be inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFaceProfile {
    pub photo_id: Uuid,
    pub user_id: Uuid,
    pub face_embedding: Vec<f32>,
    pub face_name: Option<String>,
    pub bbox: BoundingBox,
    pub detection_confidence: f32,
    pub metadata: FaceMetadata,
}

/// A stored descriptor that the user has already attached a name to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedDescriptor {
    pub profile_id: Uuid,
    pub face_name: String,
    pub face_embedding: Vec<f32>,
}
