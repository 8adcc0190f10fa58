use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A hit from the raw vector-similarity query.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SearchCandidate {
    #[garde(skip)]
    pub photo_id: Uuid,
    #[garde(length(min = 1, max = 512))]
    pub file_name: String,
    /// Where the vision stage fetches the image from (object key or URL).
    #[garde(length(min = 1))]
    pub image_url: String,
    #[garde(skip)]
    pub mime_type: Option<String>,
    #[garde(range(min = 0.0, max = 1.0))]
    pub similarity: f64,
    #[serde(default)]
    #[garde(skip)]
    pub is_favorite: bool,
    #[garde(skip)]
    pub created_at: DateTime<Utc>,
    #[garde(skip)]
    pub taken_at: Option<DateTime<Utc>>,
    #[garde(skip)]
    pub caption: Option<String>,
}

/// One field per signal that contributed to a candidate's score.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub embedding_similarity: f64,
    pub recency_boost: f64,
    pub favorite_boost: f64,
    pub temporal_relevance: f64,
    pub diversity_penalty: f64,
}

/// Vision judge verdict for one image/query pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchVerdict {
    pub matches: bool,
    /// 0..=100
    pub confidence: u8,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub concerns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: SearchCandidate,
    pub final_score: f64,
    pub score_breakdown: ScoreBreakdown,
    /// Set once the vision stage has accepted the candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<MatchVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_score: Option<f64>,
}

impl RankedCandidate {
    /// The score the list is currently ordered by.
    pub fn rank_score(&self) -> f64 {
        self.combined_score.unwrap_or(self.final_score)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankStage {
    Scoring,
    Diversity,
    Verification,
}

/// Why a candidate was dropped by the vision stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    NoMatch,
    LowConfidence { confidence: u8 },
    Error { message: String },
}

/// Progress events emitted while ranking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RankEvent {
    StageStarted { stage: RankStage, candidates: usize },
    StageFinished { stage: RankStage, candidates: usize },
    BatchStarted { batch: usize, total_batches: usize, size: usize },
    CandidateVerified { photo_id: Uuid, confidence: u8 },
    CandidateRejected { photo_id: Uuid, reason: RejectReason },
}
