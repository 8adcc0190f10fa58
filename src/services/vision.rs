use async_trait::async_trait;
use serde::Deserialize;

use crate::models::search::MatchVerdict;
use crate::services::gateway::ProviderError;

/// An image-and-text capable judge that decides whether an image depicts
/// what a search query asks for.
#[async_trait]
pub trait VisionJudge: Send + Sync {
    async fn evaluate_image_match(
        &self,
        image: &[u8],
        mime_type: &str,
        query: &str,
    ) -> Result<MatchVerdict, ProviderError>;
}

/// Prompt sent alongside the image.
pub fn verification_prompt(query: &str) -> String {
    format!(
        concat!(
            "You are verifying photo search results. The user searched for: \"{}\". ",
            "Look at the image and decide whether it genuinely shows what the user asked for. ",
            "Be strict about the subject: a similar-looking but different thing is not a match. ",
            "Respond with ONLY a JSON object with these fields: ",
            "\"matches\" (boolean), \"confidence\" (integer 0-100), ",
            "\"reasoning\" (short string), \"concerns\" (array of strings)."
        ),
        query
    )
}

#[derive(Deserialize)]
struct RawVerdict {
    matches: bool,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    concerns: Vec<String>,
}

/// Parse the judge's free-text answer into a verdict.
///
/// Models often wrap JSON in prose or code fences, so the outermost `{...}`
/// span is extracted first. Confidence is clamped into 0..=100.
pub fn parse_verdict(text: &str) -> Result<MatchVerdict, ProviderError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(ProviderError::Malformed(format!(
                "no JSON object in verdict: {}",
                text.chars().take(200).collect::<String>()
            )))
        }
    };

    let raw: RawVerdict = serde_json::from_str(json)?;
    if !raw.confidence.is_finite() {
        return Err(ProviderError::Malformed("confidence is not a number".into()));
    }

    Ok(MatchVerdict {
        matches: raw.matches,
        confidence: raw.confidence.round().clamp(0.0, 100.0) as u8,
        reasoning: raw.reasoning,
        concerns: raw.concerns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_inside_prose() {
        let text = "Sure! ```json\n{\"matches\": false, \"confidence\": 85, \"reasoning\": \"This is a panda, not a bear\", \"concerns\": [\"species\"]}\n```";
        let verdict = parse_verdict(text).unwrap();
        assert!(!verdict.matches);
        assert_eq!(verdict.confidence, 85);
        assert_eq!(verdict.concerns, vec!["species".to_string()]);
    }

    #[test]
    fn test_parse_verdict_clamps_confidence() {
        let verdict = parse_verdict(r#"{"matches": true, "confidence": 140.4}"#).unwrap();
        assert_eq!(verdict.confidence, 100);
        assert!(verdict.reasoning.is_empty());
    }

    #[test]
    fn test_parse_verdict_without_json() {
        assert!(matches!(
            parse_verdict("yes, that is a bear"),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_prompt_mentions_query() {
        assert!(verification_prompt("brown bear").contains("\"brown bear\""));
    }
}
