use std::cmp::Ordering;

use uuid::Uuid;

use crate::models::face::NamedDescriptor;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

#[derive(Debug, Clone, Copy)]
pub struct FaceMatchConfig {
    /// Minimum cosine similarity for a named descriptor to count as a match.
    pub threshold: f32,
}

impl Default for FaceMatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub profile_id: Uuid,
    pub face_name: String,
    pub similarity: f32,
}

/// Cosine similarity, or `None` when the vectors are not comparable
/// (different lengths, empty, or zero norm).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    Some(dot_product / (norm_a * norm_b))
}

/// Score a probe descriptor against every named descriptor of the user and
/// return the ones at or above the threshold, most similar first.
pub fn match_face(probe: &[f32], named: &[NamedDescriptor], config: &FaceMatchConfig) -> Vec<FaceMatch> {
    let mut matches: Vec<FaceMatch> = named
        .iter()
        .filter_map(|descriptor| {
            let similarity = cosine_similarity(probe, &descriptor.face_embedding)?;
            (similarity >= config.threshold).then(|| FaceMatch {
                profile_id: descriptor.profile_id,
                face_name: descriptor.face_name.clone(),
                similarity,
            })
        })
        .collect();

    matches.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal));
    matches
}

/// The identity to attach to a new face, or `None` for "unidentified".
pub fn best_match(probe: &[f32], named: &[NamedDescriptor], config: &FaceMatchConfig) -> Option<FaceMatch> {
    match_face(probe, named, config).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, embedding: Vec<f32>) -> NamedDescriptor {
        NamedDescriptor {
            profile_id: Uuid::new_v4(),
            face_name: name.to_string(),
            face_embedding: embedding,
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![0.3, 0.4, 0.5];
        let sim = cosine_similarity(&a, &a).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_incomparable() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
    }

    #[test]
    fn test_matches_sorted_by_similarity() {
        let descriptors = vec![
            named("Sam", vec![0.6, 0.8, 0.0]),
            named("Alex", vec![1.0, 0.05, 0.0]),
            named("Robin", vec![0.0, 0.0, 1.0]),
        ];

        let matches = match_face(&[1.0, 0.0, 0.0], &descriptors, &FaceMatchConfig::default());

        let names: Vec<&str> = matches.iter().map(|m| m.face_name.as_str()).collect();
        assert_eq!(names, vec!["Alex", "Sam"]);
        assert!(matches[0].similarity > matches[1].similarity);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let descriptors = vec![named("Edge", vec![0.4, 0.9])];
        let probe = [1.0, 0.0];
        let exact = cosine_similarity(&probe, &descriptors[0].face_embedding).unwrap();

        let config = FaceMatchConfig { threshold: exact };
        assert_eq!(best_match(&probe, &descriptors, &config).unwrap().face_name, "Edge");
    }

    #[test]
    fn test_no_named_faces_is_unidentified() {
        assert!(best_match(&[1.0, 0.0], &[], &FaceMatchConfig::default()).is_none());
    }

    #[test]
    fn test_below_threshold_is_unidentified() {
        let descriptors = vec![named("Sam", vec![0.0, 1.0])];
        assert!(best_match(&[1.0, 0.0], &descriptors, &FaceMatchConfig::default()).is_none());
    }
}
