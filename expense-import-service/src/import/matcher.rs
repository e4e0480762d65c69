//! Fuzzy property matchers behind the resolver's last stage.

use crate::config::MatcherBackend;
use crate::import::json_span::first_balanced_object;
use crate::models::{MatchCandidate, MatchMethod, PropertyMatch};
use crate::services::metrics::record_ai_call;
use crate::services::providers::{GenerationParams, ProviderError, TextProvider};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("matcher reply could not be read: {0}")]
    InvalidReply(String),
}

/// Best-effort matches keyed by trimmed identifier; absent keys are unmatched.
#[async_trait]
pub trait PropertyMatcher: Send + Sync {
    fn backend(&self) -> MatcherBackend;

    async fn match_properties(
        &self,
        identifiers: &[String],
        candidates: &[MatchCandidate],
    ) -> Result<BTreeMap<String, PropertyMatch>, MatcherError>;
}

// =============================================================================
// LLM matcher
// =============================================================================

/// One batched prompt per document.
pub struct LlmPropertyMatcher {
    provider: Arc<dyn TextProvider>,
}

impl LlmPropertyMatcher {
    pub fn new(provider: Arc<dyn TextProvider>) -> Self {
        Self { provider }
    }

    fn build_prompt(identifiers: &[String], candidates: &[MatchCandidate]) -> String {
        let mut candidates: Vec<&MatchCandidate> = candidates.iter().collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name).then(a.property_id.cmp(&b.property_id)));

        let identifier_lines = identifiers
            .iter()
            .map(|id| format!("- {}", id.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        let candidate_lines = candidates
            .iter()
            .map(|c| {
                format!(
                    "- id: {} | name: {} | address: {}",
                    c.property_id,
                    c.name,
                    c.address.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You match property identifiers from a vendor invoice to known properties.\n\
             Compare each identifier against both the name and the address of every candidate.\n\n\
             Identifiers:\n{}\n\n\
             Candidates:\n{}\n\n\
             Respond with one JSON object only. Use each identifier exactly as listed as a key.\n\
             For a confident match the value is \
             {{\"propertyId\": \"<candidate id>\", \"confidence\": <0.0-1.0>, \"reason\": \"<short reason>\"}}.\n\
             Omit identifiers that match no candidate. Never invent ids.",
            identifier_lines, candidate_lines
        )
    }

    fn parse_reply(
        text: &str,
        identifiers: &[String],
        candidates: &[MatchCandidate],
    ) -> Result<BTreeMap<String, PropertyMatch>, MatcherError> {
        let span = first_balanced_object(text)
            .ok_or_else(|| MatcherError::InvalidReply("no JSON object in reply".to_string()))?;
        let raw: BTreeMap<String, Value> = serde_json::from_str(span)
            .map_err(|e| MatcherError::InvalidReply(e.to_string()))?;

        let requested: HashSet<&str> = identifiers.iter().map(|s| s.trim()).collect();
        let known: HashSet<Uuid> = candidates.iter().map(|c| c.property_id).collect();

        let mut matches = BTreeMap::new();
        for (key, value) in raw {
            let key = key.trim();
            if !requested.contains(key) || value.is_null() {
                continue;
            }
            let Ok(reply) = serde_json::from_value::<LlmMatch>(value) else {
                tracing::debug!(identifier = %key, "Ignoring malformed match entry");
                continue;
            };
            let Ok(property_id) = Uuid::parse_str(reply.property_id.trim()) else {
                continue;
            };
            if !known.contains(&property_id) {
                tracing::debug!(identifier = %key, property_id = %property_id, "Ignoring unknown property id");
                continue;
            }

            let confidence = if reply.confidence.is_finite() {
                reply.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            matches.insert(
                key.to_string(),
                PropertyMatch {
                    property_id,
                    confidence,
                    reason: reply.reason.unwrap_or_else(|| "AI match".to_string()),
                    method: MatchMethod::Ai,
                },
            );
        }
        Ok(matches)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmMatch {
    property_id: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl PropertyMatcher for LlmPropertyMatcher {
    fn backend(&self) -> MatcherBackend {
        MatcherBackend::Llm
    }

    async fn match_properties(
        &self,
        identifiers: &[String],
        candidates: &[MatchCandidate],
    ) -> Result<BTreeMap<String, PropertyMatch>, MatcherError> {
        if identifiers.is_empty() || candidates.is_empty() {
            return Ok(BTreeMap::new());
        }

        let prompt = Self::build_prompt(identifiers, candidates);
        let start = Instant::now();
        let response = self
            .provider
            .generate(&prompt, &[], &GenerationParams::structured())
            .await;
        let elapsed = start.elapsed().as_secs_f64();

        let response = match response {
            Ok(response) => {
                record_ai_call("match", "success", elapsed);
                response
            }
            Err(e) => {
                record_ai_call("match", "error", elapsed);
                return Err(e.into());
            }
        };

        Self::parse_reply(
            response.text.as_deref().unwrap_or_default(),
            identifiers,
            candidates,
        )
    }
}

// =============================================================================
// Similarity matcher
// =============================================================================

/// Levenshtein similarity over name and address, for deployments without AI.
pub struct SimilarityMatcher {
    threshold: f64,
}

impl SimilarityMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    fn best_match(&self, identifier: &str, candidates: &[MatchCandidate]) -> Option<PropertyMatch> {
        let mut best: Option<(f64, &MatchCandidate, &'static str)> = None;

        for candidate in candidates {
            let by_name = similarity(identifier, &candidate.name);
            let by_address = candidate
                .address
                .as_deref()
                .map(|a| similarity(identifier, a))
                .unwrap_or(0.0);
            let (score, field) = if by_address > by_name {
                (by_address, "address")
            } else {
                (by_name, "name")
            };

            let better = match best {
                None => true,
                Some((best_score, best_candidate, _)) => {
                    score > best_score
                        || (score == best_score
                            && candidate.property_id < best_candidate.property_id)
                }
            };
            if better {
                best = Some((score, candidate, field));
            }
        }

        let (score, candidate, field) = best?;
        (score >= self.threshold).then(|| PropertyMatch {
            property_id: candidate.property_id,
            confidence: (score * 100.0).round() / 100.0,
            reason: format!(
                "{} similarity {:.2} with '{}'",
                if field == "name" { "Name" } else { "Address" },
                score,
                if field == "name" {
                    candidate.name.as_str()
                } else {
                    candidate.address.as_deref().unwrap_or_default()
                }
            ),
            method: MatchMethod::Similarity,
        })
    }
}

#[async_trait]
impl PropertyMatcher for SimilarityMatcher {
    fn backend(&self) -> MatcherBackend {
        MatcherBackend::Similarity
    }

    async fn match_properties(
        &self,
        identifiers: &[String],
        candidates: &[MatchCandidate],
    ) -> Result<BTreeMap<String, PropertyMatch>, MatcherError> {
        let mut seen = HashMap::new();
        for identifier in identifiers {
            let key = identifier.trim();
            if seen.contains_key(key) {
                continue;
            }
            seen.insert(key.to_string(), self.best_match(key, candidates));
        }
        Ok(seen
            .into_iter()
            .filter_map(|(key, found)| found.map(|m| (key, m)))
            .collect())
    }
}

/// `1 - distance / max_len` over lowercase alphanumeric words.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_words(a);
    let b = normalize_words(b);

    if a == b {
        return 1.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - levenshtein_distance(&a, &b) as f64 / max_len as f64
}

fn normalize_words(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Minimum single-character edits between two strings.
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::MockTextProvider;

    fn candidates() -> Vec<MatchCandidate> {
        vec![
            MatchCandidate {
                property_id: Uuid::from_u128(1),
                name: "Sunset Villa".to_string(),
                address: Some("12 Ocean Drive".to_string()),
            },
            MatchCandidate {
                property_id: Uuid::from_u128(2),
                name: "Oak Court".to_string(),
                address: Some("400 Elm Street".to_string()),
            },
        ]
    }

    #[test]
    fn levenshtein_counts_edits() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
        assert_eq!(levenshtein_distance("café", "cafe"), 1);
    }

    #[test]
    fn similarity_ignores_case_and_punctuation() {
        assert_eq!(similarity("SUNSET-VILLA", "Sunset Villa"), 1.0);
        assert!(similarity("Sunset Vila", "Sunset Villa") > 0.9);
        assert!(similarity("Unknown Ave", "Sunset Villa") < 0.5);
    }

    #[tokio::test]
    async fn similarity_matcher_uses_name_or_address() {
        let matcher = SimilarityMatcher::new(0.75);
        let identifiers = vec![
            "Sunset Vila".to_string(),
            "400 Elm Streat".to_string(),
            "Unknown Ave".to_string(),
        ];
        let matches = matcher
            .match_properties(&identifiers, &candidates())
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches["Sunset Vila"].property_id, Uuid::from_u128(1));
        assert_eq!(matches["Sunset Vila"].method, MatchMethod::Similarity);
        assert_eq!(matches["400 Elm Streat"].property_id, Uuid::from_u128(2));
        assert!(matches["400 Elm Streat"].reason.starts_with("Address"));
        assert!(!matches.contains_key("Unknown Ave"));
    }

    #[tokio::test]
    async fn llm_reply_drops_unknown_ids_and_clamps_confidence() {
        let provider = Arc::new(MockTextProvider::new(true));
        provider.push_reply(format!(
            "```json\n{{\"Sunset Vila\": {{\"propertyId\": \"{}\", \"confidence\": 1.7, \"reason\": \"typo\"}},\n\
             \"Ghost House\": {{\"propertyId\": \"{}\", \"confidence\": 0.9}},\n\
             \"Unasked\": {{\"propertyId\": \"{}\", \"confidence\": 0.9}},\n\
             \"Unknown Ave\": null}}\n```",
            Uuid::from_u128(1),
            Uuid::from_u128(99),
            Uuid::from_u128(2),
        ));
        let matcher = LlmPropertyMatcher::new(provider.clone());
        let identifiers = vec![
            "Sunset Vila".to_string(),
            "Ghost House".to_string(),
            "Unknown Ave".to_string(),
        ];

        let matches = matcher
            .match_properties(&identifiers, &candidates())
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        let sunset = &matches["Sunset Vila"];
        assert_eq!(sunset.property_id, Uuid::from_u128(1));
        assert_eq!(sunset.confidence, 1.0);
        assert_eq!(sunset.reason, "typo");
        assert_eq!(sunset.method, MatchMethod::Ai);

        let prompt = &provider.prompts()[0];
        assert!(prompt.contains("- Sunset Vila"));
        assert!(prompt.contains("address: 400 Elm Street"));
    }

    #[test]
    fn prompt_is_deterministic_in_candidate_order() {
        let mut reversed = candidates();
        reversed.reverse();
        let ids = vec!["A".to_string()];
        assert_eq!(
            LlmPropertyMatcher::build_prompt(&ids, &candidates()),
            LlmPropertyMatcher::build_prompt(&ids, &reversed)
        );
    }

    #[tokio::test]
    async fn llm_garbage_reply_is_an_error() {
        let provider = Arc::new(MockTextProvider::new(true));
        provider.push_reply("no idea");
        let matcher = LlmPropertyMatcher::new(provider);
        let err = matcher
            .match_properties(&["X".to_string()], &candidates())
            .await
            .unwrap_err();
        assert!(matches!(err, MatcherError::InvalidReply(_)));
    }
}
