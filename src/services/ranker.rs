//! Retrieval Ranker.
//!
//! Three stages over the raw similarity hits of a search:
//! 1. multi-signal scoring (similarity, recency, favorites, temporal hints),
//! 2. diversity re-ranking that pushes down runs of near-duplicate file names,
//! 3. optional vision verification that drops semantically wrong matches and
//!    blends the judge's confidence into the score.
//!
//! Stages 1 and 2 are pure. Stage 3 calls out once per candidate in bounded
//! batches. Progress is reported as `RankEvent`s on an optional channel.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use futures::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::models::search::{
    MatchVerdict, RankEvent, RankStage, RankedCandidate, RejectReason, ScoreBreakdown,
    SearchCandidate,
};
use crate::services::gateway::ProviderError;
use crate::services::query_intent::{QueryIntent, Season};
use crate::services::storage::{detect_mime_type, FetchError, ImageFetcher};
use crate::services::vision::VisionJudge;

#[derive(Debug, Clone)]
pub struct RankerConfig {
    /// Boost for an item created today; decays linearly to zero.
    pub recency_max_boost: f64,
    pub recency_window_days: f64,
    pub favorite_boost: f64,
    pub season_boost: f64,
    pub year_boost: f64,
    /// How many previously emitted names a candidate is compared against.
    pub diversity_window: usize,
    pub diversity_penalty: f64,
    pub verify_batch_size: usize,
    pub verify_min_confidence: u8,
    /// Share of the combined score taken from the judge's confidence.
    pub verify_weight: f64,
    pub verify_timeout: Duration,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            recency_max_boost: 0.1,
            recency_window_days: 365.0,
            favorite_boost: 0.15,
            season_boost: 0.2,
            year_boost: 0.2,
            diversity_window: 3,
            diversity_penalty: 0.05,
            verify_batch_size: 5,
            verify_min_confidence: 60,
            verify_weight: 0.4,
            verify_timeout: Duration::from_secs(30),
        }
    }
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn emit(events: Option<&UnboundedSender<RankEvent>>, event: RankEvent) {
    if let Some(tx) = events {
        // Nobody listening is fine.
        let _ = tx.send(event);
    }
}

/// Stage 1: score every candidate. Output order follows the input.
pub fn score_candidates(
    candidates: Vec<SearchCandidate>,
    intent: &QueryIntent,
    now: DateTime<Utc>,
    config: &RankerConfig,
) -> Vec<RankedCandidate> {
    candidates
        .into_iter()
        .map(|candidate| {
            let recency_boost = if intent.is_temporal() {
                0.0
            } else {
                let age_days = (now - candidate.created_at).num_days().max(0) as f64;
                config.recency_max_boost * (1.0 - age_days / config.recency_window_days).max(0.0)
            };

            let favorite_boost = if candidate.is_favorite {
                config.favorite_boost
            } else {
                0.0
            };

            let when = candidate.taken_at.unwrap_or(candidate.created_at);
            let mut temporal_relevance = 0.0;
            if let Some(season) = intent.season {
                if Season::of_month(when.month()) == season {
                    temporal_relevance += config.season_boost;
                }
            }
            if let Some(year) = intent.year {
                if when.year() == year {
                    temporal_relevance += config.year_boost;
                }
            }

            let score_breakdown = ScoreBreakdown {
                embedding_similarity: candidate.similarity,
                recency_boost,
                favorite_boost,
                temporal_relevance,
                diversity_penalty: 0.0,
            };
            let final_score = (candidate.similarity
                + recency_boost
                + favorite_boost
                + temporal_relevance)
                .clamp(0.0, 1.0);

            RankedCandidate {
                candidate,
                final_score,
                score_breakdown,
                verification: None,
                combined_score: None,
            }
        })
        .collect()
}

/// File name reduced to what survives a burst of shots: no extension, no
/// digits, lowercase, separators collapsed to single spaces.
///
/// Names without any letters (`20240101_123456.jpg`) keep their shape
/// instead, with each digit run as `#`, so timestamp-named bursts still
/// collide.
pub fn normalize_name(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };

    let words = stem
        .to_lowercase()
        .split(|c: char| !c.is_alphabetic())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !words.is_empty() {
        return words;
    }

    let mut shape = String::with_capacity(stem.len());
    for c in stem.chars() {
        if !c.is_numeric() {
            shape.push(c);
        } else if !shape.ends_with('#') {
            shape.push('#');
        }
    }
    shape
}

/// Stage 2: order by score and penalize names seen within the last
/// `diversity_window` emitted results. One forward pass, then a stable
/// re-sort on the adjusted scores.
pub fn apply_diversity(mut ranked: Vec<RankedCandidate>, config: &RankerConfig) -> Vec<RankedCandidate> {
    ranked.sort_by(|a, b| by_score_desc(a.final_score, b.final_score));

    let mut window: VecDeque<String> = VecDeque::with_capacity(config.diversity_window + 1);
    for item in ranked.iter_mut() {
        let name = normalize_name(&item.candidate.file_name);
        if !name.is_empty() && window.contains(&name) {
            item.score_breakdown.diversity_penalty = config.diversity_penalty;
            item.final_score = (item.final_score - config.diversity_penalty).max(0.0);
        }
        if config.diversity_window > 0 {
            window.push_back(name);
            if window.len() > config.diversity_window {
                window.pop_front();
            }
        }
    }

    ranked.sort_by(|a, b| by_score_desc(a.final_score, b.final_score));
    ranked
}

/// Score blend for a verified candidate.
pub fn combine_scores(final_score: f64, confidence: u8, weight: f64) -> f64 {
    final_score * (1.0 - weight) + (f64::from(confidence) / 100.0) * weight
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Failed to fetch image: {0}")]
    Fetch(#[from] FetchError),

    #[error("Vision judge failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Verification timed out after {0:?}")]
    Timeout(Duration),
}

pub struct Ranker {
    config: RankerConfig,
    judge: Option<Arc<dyn VisionJudge>>,
    fetcher: Arc<dyn ImageFetcher>,
}

impl Ranker {
    pub fn new(
        config: RankerConfig,
        judge: Option<Arc<dyn VisionJudge>>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            config,
            judge,
            fetcher,
        }
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    pub fn can_verify(&self) -> bool {
        self.judge.is_some()
    }

    pub async fn rank(
        &self,
        query: &str,
        candidates: Vec<SearchCandidate>,
        verify: bool,
        events: Option<&UnboundedSender<RankEvent>>,
    ) -> Vec<RankedCandidate> {
        self.rank_at(Utc::now(), query, candidates, verify, events).await
    }

    /// Run all stages with an explicit clock.
    pub async fn rank_at(
        &self,
        now: DateTime<Utc>,
        query: &str,
        candidates: Vec<SearchCandidate>,
        verify: bool,
        events: Option<&UnboundedSender<RankEvent>>,
    ) -> Vec<RankedCandidate> {
        let start = Instant::now();
        let intent = QueryIntent::parse(query, now.date_naive());

        emit(events, RankEvent::StageStarted { stage: RankStage::Scoring, candidates: candidates.len() });
        let scored = score_candidates(candidates, &intent, now, &self.config);
        emit(events, RankEvent::StageFinished { stage: RankStage::Scoring, candidates: scored.len() });

        emit(events, RankEvent::StageStarted { stage: RankStage::Diversity, candidates: scored.len() });
        let mut ranked = apply_diversity(scored, &self.config);
        emit(events, RankEvent::StageFinished { stage: RankStage::Diversity, candidates: ranked.len() });

        if verify {
            match self.judge {
                Some(ref judge) => {
                    emit(events, RankEvent::StageStarted { stage: RankStage::Verification, candidates: ranked.len() });
                    ranked = self.verify_candidates(judge.as_ref(), query, ranked, events).await;
                    emit(events, RankEvent::StageFinished { stage: RankStage::Verification, candidates: ranked.len() });
                }
                None => tracing::warn!("Vision verification requested but no judge is configured"),
            }
        }

        metrics::histogram!("search_rank_seconds").record(start.elapsed().as_secs_f64());
        tracing::debug!(
            query = %query,
            intent = ?intent,
            results = ranked.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Ranking complete"
        );
        ranked
    }

    /// Stage 3. A candidate survives only with a positive verdict at or above
    /// the confidence floor; any error while verifying rejects it.
    async fn verify_candidates(
        &self,
        judge: &dyn VisionJudge,
        query: &str,
        ranked: Vec<RankedCandidate>,
        events: Option<&UnboundedSender<RankEvent>>,
    ) -> Vec<RankedCandidate> {
        let batch_size = self.config.verify_batch_size.max(1);
        let total_batches = ranked.len().div_ceil(batch_size);
        let mut survivors = Vec::with_capacity(ranked.len());

        for (index, batch) in ranked.chunks(batch_size).enumerate() {
            emit(events, RankEvent::BatchStarted { batch: index + 1, total_batches, size: batch.len() });

            let verdicts = join_all(
                batch
                    .iter()
                    .map(|item| self.verify_one(judge, query, &item.candidate)),
            )
            .await;

            for (item, verdict) in batch.iter().zip(verdicts) {
                let photo_id = item.candidate.photo_id;
                match self.accept(verdict) {
                    Ok(verdict) => {
                        emit(events, RankEvent::CandidateVerified { photo_id, confidence: verdict.confidence });
                        let mut accepted = item.clone();
                        accepted.combined_score = Some(combine_scores(
                            item.final_score,
                            verdict.confidence,
                            self.config.verify_weight,
                        ));
                        accepted.verification = Some(verdict);
                        survivors.push(accepted);
                    }
                    Err(reason) => self.reject(photo_id, reason, events),
                }
            }
        }

        survivors.sort_by(|a, b| by_score_desc(a.rank_score(), b.rank_score()));
        survivors
    }

    async fn verify_one(
        &self,
        judge: &dyn VisionJudge,
        query: &str,
        candidate: &SearchCandidate,
    ) -> Result<MatchVerdict, VerificationError> {
        let call = async {
            let bytes = self.fetcher.fetch_image_bytes(&candidate.image_url).await?;
            let mime_type = detect_mime_type(&bytes, candidate.mime_type.as_deref());
            let verdict = judge.evaluate_image_match(&bytes, &mime_type, query).await?;
            Ok::<_, VerificationError>(verdict)
        };

        match tokio::time::timeout(self.config.verify_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(VerificationError::Timeout(self.config.verify_timeout)),
        }
    }

    fn accept(&self, verdict: Result<MatchVerdict, VerificationError>) -> Result<MatchVerdict, RejectReason> {
        let verdict = verdict.map_err(|e| RejectReason::Error { message: e.to_string() })?;
        if !verdict.matches {
            return Err(RejectReason::NoMatch);
        }
        if verdict.confidence < self.config.verify_min_confidence {
            return Err(RejectReason::LowConfidence {
                confidence: verdict.confidence,
            });
        }
        Ok(verdict)
    }

    fn reject(&self, photo_id: Uuid, reason: RejectReason, events: Option<&UnboundedSender<RankEvent>>) {
        let label = match reason {
            RejectReason::NoMatch => "no_match",
            RejectReason::LowConfidence { .. } => "low_confidence",
            RejectReason::Error { ref message } => {
                tracing::warn!(photo_id = %photo_id, error = %message, "Vision verification failed, dropping candidate");
                "error"
            }
        };
        metrics::counter!("search_candidates_rejected_total", "reason" => label).increment(1);
        emit(events, RankEvent::CandidateRejected { photo_id, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tokio::sync::mpsc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn candidate(file_name: &str, similarity: f64) -> SearchCandidate {
        SearchCandidate {
            photo_id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            image_url: format!("https://photos.example.com/{}", file_name),
            mime_type: Some("image/jpeg".to_string()),
            similarity,
            is_favorite: false,
            created_at: now() - ChronoDuration::days(400),
            taken_at: None,
            caption: None,
        }
    }

    struct NoFetch;

    #[async_trait]
    impl ImageFetcher for NoFetch {
        async fn fetch_image_bytes(&self, _: &str) -> Result<Vec<u8>, FetchError> {
            Ok(b"jpeg".to_vec())
        }
    }

    struct FailingJudge;

    #[async_trait]
    impl VisionJudge for FailingJudge {
        async fn evaluate_image_match(&self, _: &[u8], _: &str, _: &str) -> Result<MatchVerdict, ProviderError> {
            Err(ProviderError::Malformed("no JSON object in verdict".into()))
        }
    }

    /// Verdicts keyed by image bytes; unknown images error.
    struct UrlJudge {
        fetched: HashMap<Vec<u8>, MatchVerdict>,
    }

    #[async_trait]
    impl VisionJudge for UrlJudge {
        async fn evaluate_image_match(&self, image: &[u8], _: &str, _: &str) -> Result<MatchVerdict, ProviderError> {
            self.fetched
                .get(image)
                .cloned()
                .ok_or_else(|| ProviderError::Api { status: 503, body: "overloaded".into() })
        }
    }

    /// Serves the URL itself as the image bytes so the judge can tell
    /// candidates apart.
    struct EchoFetch;

    #[async_trait]
    impl ImageFetcher for EchoFetch {
        async fn fetch_image_bytes(&self, location: &str) -> Result<Vec<u8>, FetchError> {
            Ok(location.as_bytes().to_vec())
        }
    }

    /// Accepts everything after `delay`, tracking how many calls overlap.
    #[derive(Default)]
    struct PeakJudge {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl VisionJudge for PeakJudge {
        async fn evaluate_image_match(&self, _: &[u8], _: &str, _: &str) -> Result<MatchVerdict, ProviderError> {
            let current = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(current, AtomicOrdering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(verdict(true, 90))
        }
    }

    fn verdict(matches: bool, confidence: u8) -> MatchVerdict {
        MatchVerdict {
            matches,
            confidence,
            reasoning: String::new(),
            concerns: Vec::new(),
        }
    }

    fn ranker() -> Ranker {
        Ranker::new(RankerConfig::default(), None, Arc::new(NoFetch))
    }

    #[tokio::test]
    async fn test_bicycle_scored_with_recency() {
        let mut bike = candidate("bike.jpg", 0.62);
        bike.created_at = now();
        bike.caption = Some("a red bicycle on a street".into());

        let ranked = ranker().rank_at(now(), "bicycles", vec![bike], false, None).await;

        assert_eq!(ranked.len(), 1);
        let breakdown = &ranked[0].score_breakdown;
        assert!((breakdown.recency_boost - 0.1).abs() < 1e-9);
        assert_eq!(breakdown.favorite_boost, 0.0);
        assert_eq!(breakdown.temporal_relevance, 0.0);
        assert!((ranked[0].final_score - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_recency_decays_linearly() {
        let mut half = candidate("a.jpg", 0.5);
        half.created_at = now() - ChronoDuration::days(182);
        let mut old = candidate("b.jpg", 0.5);
        old.created_at = now() - ChronoDuration::days(500);

        let scored = score_candidates(vec![half, old], &QueryIntent::default(), now(), &RankerConfig::default());

        let expected = 0.1 * (1.0 - 182.0 / 365.0);
        assert!((scored[0].score_breakdown.recency_boost - expected).abs() < 1e-9);
        assert_eq!(scored[1].score_breakdown.recency_boost, 0.0);
    }

    #[test]
    fn test_favorite_ranks_strictly_higher() {
        let plain = candidate("a.jpg", 0.7);
        let mut fav = candidate("b.jpg", 0.7);
        fav.is_favorite = true;

        let scored = score_candidates(vec![plain, fav], &QueryIntent::default(), now(), &RankerConfig::default());
        let ranked = apply_diversity(scored, &RankerConfig::default());

        assert_eq!(ranked[0].candidate.file_name, "b.jpg");
        assert!(ranked[0].final_score > ranked[1].final_score);
        assert_eq!(ranked[0].score_breakdown.favorite_boost, 0.15);
    }

    #[test]
    fn test_temporal_query_skips_recency_and_rewards_matches() {
        let mut summer = candidate("a.jpg", 0.5);
        summer.created_at = now();
        summer.taken_at = Some(Utc.with_ymd_and_hms(2025, 7, 4, 10, 0, 0).unwrap());
        let mut winter = candidate("b.jpg", 0.5);
        winter.created_at = now();
        winter.taken_at = Some(Utc.with_ymd_and_hms(2024, 1, 4, 10, 0, 0).unwrap());

        let intent = QueryIntent::parse("beach last summer last year", now().date_naive());
        let scored = score_candidates(vec![summer, winter], &intent, now(), &RankerConfig::default());

        assert_eq!(scored[0].score_breakdown.recency_boost, 0.0);
        assert!((scored[0].score_breakdown.temporal_relevance - 0.4).abs() < 1e-9);
        assert_eq!(scored[1].score_breakdown.temporal_relevance, 0.0);
    }

    #[test]
    fn test_final_score_is_clamped() {
        let mut fav = candidate("a.jpg", 0.95);
        fav.is_favorite = true;
        fav.created_at = now();
        let scored = score_candidates(vec![fav], &QueryIntent::default(), now(), &RankerConfig::default());
        assert_eq!(scored[0].final_score, 1.0);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("IMG_0001.JPG"), "img");
        assert_eq!(normalize_name("IMG-0002.jpeg"), "img");
        assert_eq!(normalize_name("Beach Day (2).png"), "beach day");
        assert_eq!(normalize_name("20240101_123456.jpg"), "#_#");
        assert_eq!(normalize_name("20240101-123456.jpg"), "#-#");
        assert_eq!(normalize_name("1234.png"), "#");
        assert_eq!(normalize_name(".hidden"), "hidden");
    }

    #[test]
    fn test_burst_sequence_is_penalized() {
        let candidates = vec![
            candidate("IMG_0001.jpg", 0.90),
            candidate("IMG_0002.jpg", 0.89),
            candidate("IMG_0003.jpg", 0.88),
            candidate("IMG_0004.jpg", 0.87),
            candidate("sunset.jpg", 0.86),
        ];
        let scored = score_candidates(candidates, &QueryIntent::default(), now(), &RankerConfig::default());
        let ranked = apply_diversity(scored, &RankerConfig::default());

        let penalty = |name: &str| {
            ranked
                .iter()
                .find(|r| r.candidate.file_name == name)
                .map(|r| r.score_breakdown.diversity_penalty)
                .unwrap()
        };
        assert_eq!(penalty("IMG_0001.jpg"), 0.0);
        assert!(["IMG_0002.jpg", "IMG_0003.jpg", "IMG_0004.jpg"]
            .iter()
            .any(|n| penalty(n) > 0.0));
        assert_eq!(penalty("sunset.jpg"), 0.0);
        // The distinct photo now outranks the penalized burst shots.
        assert_eq!(ranked[1].candidate.file_name, "sunset.jpg");
    }

    #[test]
    fn test_timestamp_burst_is_penalized() {
        let candidates = vec![
            candidate("20240101_123456.jpg", 0.90),
            candidate("20240101_123457.jpg", 0.89),
            candidate("harbor.jpg", 0.86),
        ];
        let scored = score_candidates(candidates, &QueryIntent::default(), now(), &RankerConfig::default());
        let ranked = apply_diversity(scored, &RankerConfig::default());

        let names: Vec<&str> = ranked.iter().map(|r| r.candidate.file_name.as_str()).collect();
        assert_eq!(names, vec!["20240101_123456.jpg", "harbor.jpg", "20240101_123457.jpg"]);
        assert_eq!(ranked[2].score_breakdown.diversity_penalty, 0.05);
    }

    #[test]
    fn test_window_only_looks_back_k_results() {
        let config = RankerConfig {
            diversity_window: 1,
            ..RankerConfig::default()
        };
        let candidates = vec![
            candidate("dog_1.jpg", 0.9),
            candidate("cat_1.jpg", 0.8),
            candidate("dog_2.jpg", 0.7),
        ];
        let scored = score_candidates(candidates, &QueryIntent::default(), now(), &config);
        let ranked = apply_diversity(scored, &config);
        assert!(ranked.iter().all(|r| r.score_breakdown.diversity_penalty == 0.0));
    }

    #[tokio::test]
    async fn test_failed_verification_excludes_top_candidate() {
        let best = candidate("bear.jpg", 0.95);
        let panda = candidate("panda.jpg", 0.80);
        let grizzly = candidate("grizzly.jpg", 0.70);

        let mut fetched = HashMap::new();
        // `best` is missing: its verification call errors.
        fetched.insert(panda.image_url.as_bytes().to_vec(), verdict(false, 90));
        fetched.insert(grizzly.image_url.as_bytes().to_vec(), verdict(true, 88));

        let ranker = Ranker::new(
            RankerConfig::default(),
            Some(Arc::new(UrlJudge { fetched })),
            Arc::new(EchoFetch),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ranked = ranker
            .rank_at(now(), "bear", vec![best.clone(), panda, grizzly], true, Some(&tx))
            .await;
        drop(tx);

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].candidate.file_name, "grizzly.jpg");
        let expected = combine_scores(ranked[0].final_score, 88, 0.4);
        assert_eq!(ranked[0].combined_score, Some(expected));

        let mut rejected_with_error = false;
        while let Some(event) = rx.recv().await {
            if let RankEvent::CandidateRejected { photo_id, reason: RejectReason::Error { .. } } = event {
                rejected_with_error |= photo_id == best.photo_id;
            }
        }
        assert!(rejected_with_error);
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_and_survivors_resorted() {
        let a = candidate("a.jpg", 0.90);
        let b = candidate("b.jpg", 0.80);
        let c = candidate("c.jpg", 0.70);

        let mut fetched = HashMap::new();
        fetched.insert(a.image_url.as_bytes().to_vec(), verdict(true, 40));
        fetched.insert(b.image_url.as_bytes().to_vec(), verdict(true, 61));
        fetched.insert(c.image_url.as_bytes().to_vec(), verdict(true, 100));

        let config = RankerConfig {
            verify_batch_size: 2,
            ..RankerConfig::default()
        };
        let ranker = Ranker::new(config, Some(Arc::new(UrlJudge { fetched })), Arc::new(EchoFetch));
        let ranked = ranker.rank_at(now(), "dogs", vec![a, b, c], true, None).await;

        let names: Vec<&str> = ranked.iter().map(|r| r.candidate.file_name.as_str()).collect();
        // c: 0.70*0.6 + 1.00*0.4 = 0.82, b: 0.80*0.6 + 0.61*0.4 = 0.724
        assert_eq!(names, vec!["c.jpg", "b.jpg"]);
    }

    #[tokio::test]
    async fn test_verification_runs_in_bounded_batches() {
        let judge = Arc::new(PeakJudge {
            delay: Duration::from_millis(20),
            ..PeakJudge::default()
        });
        let config = RankerConfig {
            verify_batch_size: 3,
            ..RankerConfig::default()
        };
        let ranker = Ranker::new(config, Some(judge.clone()), Arc::new(NoFetch));
        let candidates: Vec<SearchCandidate> = ["ant", "bee", "cat", "dog", "eel", "fox", "gnu"]
            .iter()
            .enumerate()
            .map(|(i, name)| candidate(&format!("{}.jpg", name), 0.9 - i as f64 * 0.01))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ranked = ranker.rank_at(now(), "animals", candidates, true, Some(&tx)).await;
        drop(tx);

        assert_eq!(ranked.len(), 7);
        let peak = judge.peak.load(AtomicOrdering::SeqCst);
        assert!(peak <= 3, "{} vision calls overlapped", peak);
        assert_eq!(peak, 3);

        let mut batches = Vec::new();
        while let Some(event) = rx.recv().await {
            if let RankEvent::BatchStarted { batch, total_batches, size } = event {
                batches.push((batch, total_batches, size));
            }
        }
        assert_eq!(batches, vec![(1, 3, 3), (2, 3, 3), (3, 3, 1)]);
    }

    #[tokio::test]
    async fn test_verification_timeout_drops_candidate() {
        let judge = Arc::new(PeakJudge {
            delay: Duration::from_millis(500),
            ..PeakJudge::default()
        });
        let config = RankerConfig {
            verify_timeout: Duration::from_millis(20),
            ..RankerConfig::default()
        };
        let ranker = Ranker::new(config, Some(judge), Arc::new(NoFetch));
        let slow = candidate("slow.jpg", 0.9);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ranked = ranker.rank_at(now(), "dogs", vec![slow.clone()], true, Some(&tx)).await;
        drop(tx);

        assert!(ranked.is_empty());
        let mut timed_out = false;
        while let Some(event) = rx.recv().await {
            if let RankEvent::CandidateRejected { photo_id, reason: RejectReason::Error { message } } = event {
                timed_out |= photo_id == slow.photo_id && message.contains("timed out");
            }
        }
        assert!(timed_out);
    }

    #[tokio::test]
    async fn test_verification_skipped_without_judge() {
        let ranked = ranker()
            .rank_at(now(), "dogs", vec![candidate("a.jpg", 0.5)], true, None)
            .await;
        assert_eq!(ranked.len(), 1);
        assert!(ranked[0].verification.is_none());
    }

    #[tokio::test]
    async fn test_events_cover_each_stage() {
        let ranker = Ranker::new(RankerConfig::default(), Some(Arc::new(FailingJudge)), Arc::new(NoFetch));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ranked = ranker
            .rank_at(now(), "dogs", vec![candidate("a.jpg", 0.5)], true, Some(&tx))
            .await;
        drop(tx);
        assert!(ranked.is_empty());

        let mut stages = Vec::new();
        while let Some(event) = rx.recv().await {
            if let RankEvent::StageFinished { stage, .. } = event {
                stages.push(stage);
            }
        }
        assert_eq!(stages, vec![RankStage::Scoring, RankStage::Diversity, RankStage::Verification]);
    }
}
