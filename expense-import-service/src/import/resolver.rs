//! Property Resolver: raw identifiers to canonical properties.
//!
//! Exact and normalized equality run locally; whatever is left goes to the
//! configured [`PropertyMatcher`] in one batch per document.

use crate::import::matcher::PropertyMatcher;
use crate::models::{MatchCandidate, MatchMethod, PropertyMatch, StatementMonth};
use crate::services::cache::{mapping_fingerprint, ImportCache};
use crate::services::metrics::{record_import_stage, record_property_match};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const STATUS_SUFFIXES: [&str; 2] = ["(OLD)", "(NEW)"];

/// Drop a trailing "(OLD)" / "(NEW)" marker, case-insensitively.
pub fn strip_status_suffix(identifier: &str) -> &str {
    let trimmed = identifier.trim_end();
    for suffix in STATUS_SUFFIXES {
        if trimmed.len() >= suffix.len() {
            let split = trimmed.len() - suffix.len();
            if trimmed.is_char_boundary(split) && trimmed[split..].eq_ignore_ascii_case(suffix) {
                return &trimmed[..split];
            }
        }
    }
    trimmed
}

/// Status suffix stripped, whitespace removed, lowercased.
pub fn normalize_identifier(identifier: &str) -> String {
    strip_status_suffix(identifier)
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStage {
    Exact,
    Normalized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Matched(PropertyMatch),
    Continue,
}

impl MatchStage {
    pub const CHAIN: [MatchStage; 2] = [MatchStage::Exact, MatchStage::Normalized];

    pub fn apply(&self, identifier: &str, candidates: &[MatchCandidate]) -> StageOutcome {
        let found = match self {
            Self::Exact => candidates
                .iter()
                .filter(|c| c.name == identifier)
                .min_by_key(|c| c.property_id),
            Self::Normalized => {
                let wanted = normalize_identifier(identifier);
                if wanted.is_empty() {
                    return StageOutcome::Continue;
                }
                candidates
                    .iter()
                    .filter(|c| normalize_identifier(&c.name) == wanted)
                    .min_by_key(|c| c.property_id)
            }
        };

        match found {
            Some(candidate) => StageOutcome::Matched(PropertyMatch {
                property_id: candidate.property_id,
                confidence: self.confidence(),
                reason: match self {
                    Self::Exact => format!("Exact name match with '{}'", candidate.name),
                    Self::Normalized => format!("Normalized name match with '{}'", candidate.name),
                },
                method: self.method(),
            }),
            None => StageOutcome::Continue,
        }
    }

    fn confidence(&self) -> f64 {
        match self {
            Self::Exact => 1.0,
            Self::Normalized => 0.95,
        }
    }

    fn method(&self) -> MatchMethod {
        match self {
            Self::Exact => MatchMethod::Exact,
            Self::Normalized => MatchMethod::Normalized,
        }
    }
}

/// Outcome for every distinct identifier of a document.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub matches: BTreeMap<String, PropertyMatch>,
    pub unmatched: Vec<String>,
    /// The fuzzy stage failed or timed out; its identifiers count as unmatched.
    pub degraded: bool,
}

pub struct PropertyResolver {
    matcher: Arc<dyn PropertyMatcher>,
    cache: ImportCache,
    timeout: Duration,
}

impl PropertyResolver {
    pub fn new(matcher: Arc<dyn PropertyMatcher>, cache: ImportCache, timeout: Duration) -> Self {
        Self {
            matcher,
            cache,
            timeout,
        }
    }

    #[instrument(skip(self, identifiers, candidates), fields(org_id = %org_id, month = %month, identifiers = identifiers.len()))]
    pub async fn resolve(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        identifiers: &[String],
        candidates: &[MatchCandidate],
    ) -> Resolution {
        let distinct: BTreeSet<String> = identifiers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut resolution = Resolution::default();
        let mut remaining = Vec::new();

        for identifier in distinct {
            let outcome = MatchStage::CHAIN
                .iter()
                .map(|stage| stage.apply(&identifier, candidates))
                .find(|outcome| matches!(outcome, StageOutcome::Matched(_)));

            match outcome {
                Some(StageOutcome::Matched(found)) => {
                    record_property_match(found.method.as_str());
                    resolution.matches.insert(identifier, found);
                }
                _ => remaining.push(identifier),
            }
        }

        if !remaining.is_empty() && !candidates.is_empty() {
            let fuzzy = self.fuzzy(org_id, month, &remaining, candidates).await;
            match fuzzy {
                Some(found) => {
                    for (identifier, matched) in found {
                        if remaining.contains(&identifier) {
                            record_property_match(matched.method.as_str());
                            resolution.matches.insert(identifier, matched);
                        }
                    }
                }
                None => resolution.degraded = true,
            }
        }

        resolution.unmatched = remaining
            .into_iter()
            .filter(|id| !resolution.matches.contains_key(id))
            .collect();
        for _ in &resolution.unmatched {
            record_property_match("unmatched");
        }

        record_import_stage(
            "resolve",
            if resolution.degraded { "degraded" } else { "success" },
        );
        tracing::info!(
            matched = resolution.matches.len(),
            unmatched = resolution.unmatched.len(),
            degraded = resolution.degraded,
            "Identifiers resolved"
        );

        resolution
    }

    /// Matcher results for `remaining`, or `None` when the matcher failed.
    async fn fuzzy(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        remaining: &[String],
        candidates: &[MatchCandidate],
    ) -> Option<BTreeMap<String, PropertyMatch>> {
        let fingerprint =
            mapping_fingerprint(self.matcher.backend().as_str(), remaining, candidates);

        if let Some(cached) = self.cache.get_mapping(org_id, month, &fingerprint).await {
            return Some(cached);
        }

        let outcome = tokio::time::timeout(
            self.timeout,
            self.matcher.match_properties(remaining, candidates),
        )
        .await;

        match outcome {
            Ok(Ok(found)) => {
                self.cache
                    .put_mapping(org_id, month, &fingerprint, &found)
                    .await;
                Some(found)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    backend = self.matcher.backend().as_str(),
                    identifiers = remaining.len(),
                    "Property matcher failed; identifiers left unmatched"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    backend = self.matcher.backend().as_str(),
                    identifiers = remaining.len(),
                    "Property matcher timed out; identifiers left unmatched"
                );
                None
            }
        }
    }
}
