//! Test doubles for the external collaborators of the pipeline.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use photo_pipeline::{
    db::MemoryStore,
    models::{
        face::{BoundingBox, DetectedFace, FaceAttributes},
        photo::{Photo, ProcessingStatus},
        search::{MatchVerdict, SearchCandidate},
    },
    services::{
        faces::{FaceDetector, FaceProcessingError},
        gateway::{Captioner, EmbeddingGateway, EmbeddingProvider, ProviderError},
        queue::{ContinuationScheduler, QueueError},
        storage::{FetchError, ImageFetcher},
        vision::VisionJudge,
        worker::{QueueWorker, RetryPolicy, WorkerConfig},
    },
};

pub const DIMS: usize = 8;

/// Captions every image with the text stored under its bytes.
pub struct ScriptedCaptioner {
    failures_left: AtomicUsize,
}

impl ScriptedCaptioner {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Captioner for ScriptedCaptioner {
    async fn generate_caption(&self, image: &[u8], _: &str) -> Result<String, ProviderError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Timeout {
                operation: "caption",
                timeout: Duration::from_secs(60),
            });
        }
        Ok(format!("a photo of {}", String::from_utf8_lossy(image)))
    }
}

/// Deterministic embeddings; optionally multimodal.
pub struct HashEmbeddings {
    pub multimodal: bool,
}

fn pseudo_vector(input: &[u8]) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for (i, b) in input.iter().enumerate() {
        v[i % DIMS] += *b as f32 / 255.0;
    }
    v[0] += 1.0;
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn name(&self) -> &'static str {
        if self.multimodal {
            "clip"
        } else {
            "workers_ai"
        }
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn supports_image_embedding(&self) -> bool {
        self.multimodal
    }

    async fn generate_text_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(pseudo_vector(text.as_bytes()))
    }

    async fn generate_image_embedding(&self, image: &[u8], _: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(pseudo_vector(image))
    }
}

/// Serves image bytes from a map keyed by storage location.
#[derive(Default)]
pub struct MapFetcher {
    images: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapFetcher {
    pub fn put(&self, location: &str, bytes: &[u8]) {
        self.images
            .lock()
            .unwrap()
            .insert(location.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl ImageFetcher for MapFetcher {
    async fn fetch_image_bytes(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        self.images
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                location: location.to_string(),
                status: 404,
            })
    }
}

/// Returns the faces registered for the exact image bytes.
#[derive(Default)]
pub struct ScriptedDetector {
    faces: Mutex<HashMap<Vec<u8>, Vec<DetectedFace>>>,
}

impl ScriptedDetector {
    pub fn put(&self, image: &[u8], faces: Vec<DetectedFace>) {
        self.faces.lock().unwrap().insert(image.to_vec(), faces);
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<DetectedFace>, FaceProcessingError> {
        Ok(self
            .faces
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingScheduler {
    pub scheduled: Mutex<Vec<Uuid>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ContinuationScheduler for RecordingScheduler {
    async fn schedule(&self, user_id: Uuid) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("redis down".into()));
        }
        self.scheduled.lock().unwrap().push(user_id);
        Ok(())
    }
}

/// Judges an image a match when its bytes contain the query text.
pub struct KeywordJudge;

#[async_trait]
impl VisionJudge for KeywordJudge {
    async fn evaluate_image_match(&self, image: &[u8], _: &str, query: &str) -> Result<MatchVerdict, ProviderError> {
        let content = String::from_utf8_lossy(image).to_lowercase();
        let matches = content.contains(&query.to_lowercase());
        Ok(MatchVerdict {
            matches,
            confidence: if matches { 90 } else { 85 },
            reasoning: format!("image shows {}", content),
            concerns: Vec::new(),
        })
    }
}

pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<MapFetcher>,
    pub detector: Arc<ScriptedDetector>,
    pub scheduler: Arc<RecordingScheduler>,
    pub worker: QueueWorker,
}

/// A worker over an in-memory store with scripted collaborators.
pub fn pipeline(caption_failures: usize, multimodal: bool, faces: bool) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(MapFetcher::default());
    let detector = Arc::new(ScriptedDetector::default());
    let scheduler = Arc::new(RecordingScheduler::default());

    let gateway = EmbeddingGateway::new(
        Arc::new(ScriptedCaptioner::new(caption_failures)),
        Arc::new(HashEmbeddings { multimodal }),
        Duration::from_secs(1),
    );
    let config = WorkerConfig {
        continuation: RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        },
        ..WorkerConfig::default()
    };

    let mut worker = QueueWorker::new(
        store.clone(),
        fetcher.clone(),
        Arc::new(gateway),
        scheduler.clone(),
        config,
    );
    if faces {
        worker = worker.with_face_detection(detector.clone(), Default::default());
    }

    Pipeline {
        store,
        fetcher,
        detector,
        scheduler,
        worker,
    }
}

impl Pipeline {
    /// Save a photo whose stored bytes are `content`.
    pub fn save_photo(&self, user_id: Uuid, file_name: &str, content: &[u8]) -> Uuid {
        let id = Uuid::new_v4();
        let location = format!("users/{}/{}", user_id, file_name);
        self.fetcher.put(&location, content);
        self.store.insert_photo(Photo {
            id,
            user_id,
            storage_path: location,
            file_name: file_name.to_string(),
            mime_type: Some("image/jpeg".into()),
            processing_status: ProcessingStatus::Uploaded,
            caption: None,
            embedding: None,
            embedding_alt: None,
            is_favorite: false,
            taken_at: None,
            created_at: Utc::now(),
        });
        id
    }

    /// Run invocations until one finds the queue empty.
    pub async fn drain(&self, user_id: Uuid) -> usize {
        let mut invocations = 0;
        loop {
            let report = self.worker.run(user_id).await.unwrap();
            if report.queue_was_empty() {
                return invocations;
            }
            invocations += 1;
        }
    }
}

pub fn detected_face(descriptor: Vec<f32>) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            x: 12.0,
            y: 8.0,
            width: 80.0,
            height: 96.0,
        },
        confidence: 0.95,
        descriptor,
        attributes: FaceAttributes {
            age: Some(31.0),
            gender: Some("female".into()),
            expressions: HashMap::from([("happy".to_string(), 0.8)]),
        },
    }
}

pub fn candidate(file_name: &str, similarity: f64, created_at: DateTime<Utc>) -> SearchCandidate {
    SearchCandidate {
        photo_id: Uuid::new_v4(),
        file_name: file_name.to_string(),
        image_url: format!("search/{}", file_name),
        mime_type: Some("image/jpeg".into()),
        similarity,
        is_favorite: false,
        created_at,
        taken_at: None,
        caption: None,
    }
}
