//! Merges local and API track responses into the final answer.
//!
//! Strategy selection follows the path and the textual similarity of the
//! two responses. Integration never fails a turn: with no usable track
//! output it produces a canned fallback response instead.

use crate::config::IntegrationConfig;
use crate::routing::ProcessingPath;
use crate::tracks::{TrackResponse, TrackSource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Instant;

/// Canned reply used when both tracks fail.
pub const FALLBACK_RESPONSE: &str =
    "I'm sorry, I'm having trouble answering that right now. Could you try again in a moment?";

/// Where the final response text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    /// The local track alone.
    Local,
    /// The API track alone.
    Api,
    /// A merge of both tracks.
    Integrated,
    /// The canned fallback.
    Fallback,
}

/// How the final response was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStrategy {
    /// Responses agreed; the preferred source was used alone.
    Preference,
    /// The first track to finish was used.
    Fastest,
    /// Both responses were merged with a bridge.
    Combine,
    /// Responses diverged; the API response displaced the local one.
    Interrupt,
    /// Only one usable response existed (or the canned fallback).
    SingleSource,
}

/// The outcome of integrating one turn's track responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    /// Final response text.
    pub content: String,
    /// Source of the text.
    pub source: ResponseSource,
    /// Selection strategy that produced it.
    pub strategy: IntegrationStrategy,
    /// Token-set similarity of the two responses, when both existed.
    pub similarity_score: Option<f32>,
    /// Time spent integrating, in milliseconds.
    pub processing_ms: f64,
    /// Diagnostic metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Merges track responses under the configured strategy.
#[derive(Debug, Clone)]
pub struct Integrator {
    config: IntegrationConfig,
}

impl Integrator {
    /// Create an integrator with the given thresholds and weights.
    pub fn new(config: IntegrationConfig) -> Self {
        Self { config }
    }

    /// Produce the final response for a turn.
    ///
    /// Total: any combination of missing or failed inputs yields a
    /// result, falling back to [`FALLBACK_RESPONSE`] when neither track
    /// produced usable text.
    pub fn integrate(
        &self,
        local: Option<&TrackResponse>,
        api: Option<&TrackResponse>,
        path: ProcessingPath,
    ) -> IntegrationResult {
        let started = Instant::now();
        let local_ok = local.filter(|r| r.success && !r.content.trim().is_empty());
        let api_ok = api.filter(|r| r.success && !r.content.trim().is_empty());

        let mut result = match (local_ok, api_ok) {
            (None, None) => fallback_result("both_tracks_failed"),
            (Some(l), None) => single_source(l),
            (None, Some(a)) => single_source(a),
            (Some(l), Some(a)) => match path {
                ProcessingPath::Local => single_source(l),
                ProcessingPath::Api => single_source(a),
                ProcessingPath::Parallel | ProcessingPath::Staged => self.merge(l, a),
            },
        };

        result.processing_ms = started.elapsed().as_secs_f64() * 1_000.0;
        result
    }

    /// Merge two successful responses per the similarity rules.
    fn merge(&self, local: &TrackResponse, api: &TrackResponse) -> IntegrationResult {
        let similarity = token_jaccard(&local.content, &api.content);

        if self.config.latency_priority {
            let (winner, loser_ms) = if local.latency_ms <= api.latency_ms {
                (local, api.latency_ms)
            } else {
                (api, local.latency_ms)
            };
            let mut result = from_track(winner, IntegrationStrategy::Fastest);
            result.similarity_score = Some(similarity);
            result
                .metadata
                .insert("slower_track_ms".to_owned(), loser_ms.into());
            return result;
        }

        if similarity >= self.config.similarity_high {
            // Near-identical answers: use the preferred source alone.
            let api_score = self.config.api_preference_weight * api.quality_score.unwrap_or(0.5);
            let local_score =
                self.config.local_preference_weight * local.quality_score.unwrap_or(0.5);
            let winner = if api_score >= local_score { api } else { local };
            let mut result = from_track(winner, IntegrationStrategy::Preference);
            result.similarity_score = Some(similarity);
            return result;
        }

        if similarity >= self.config.similarity_medium {
            // Overlapping but complementary: local first, then the API
            // content with any repeated leading overlap dropped.
            let api_tail = strip_leading_overlap(&local.content, &api.content);
            let content = if api_tail.is_empty() {
                local.content.trim().to_owned()
            } else {
                format!("{} Additionally, {}", local.content.trim(), api_tail)
            };
            return IntegrationResult {
                content,
                source: ResponseSource::Integrated,
                strategy: IntegrationStrategy::Combine,
                similarity_score: Some(similarity),
                processing_ms: 0.0,
                metadata: Map::new(),
            };
        }

        // Divergent answers: trust the higher-capacity model.
        let mut result = from_track(api, IntegrationStrategy::Interrupt);
        result.similarity_score = Some(similarity);
        result
            .metadata
            .insert("discarded_source".to_owned(), "local".into());
        result
    }
}

fn single_source(track: &TrackResponse) -> IntegrationResult {
    from_track(track, IntegrationStrategy::SingleSource)
}

fn from_track(track: &TrackResponse, strategy: IntegrationStrategy) -> IntegrationResult {
    let source = match track.source {
        TrackSource::Local => ResponseSource::Local,
        TrackSource::Api => ResponseSource::Api,
    };
    IntegrationResult {
        content: track.content.trim().to_owned(),
        source,
        strategy,
        similarity_score: None,
        processing_ms: 0.0,
        metadata: Map::new(),
    }
}

/// A fallback result tagged with the reason.
pub fn fallback_result(tag: &str) -> IntegrationResult {
    let mut metadata = Map::new();
    metadata.insert("reason".to_owned(), tag.into());
    IntegrationResult {
        content: FALLBACK_RESPONSE.to_owned(),
        source: ResponseSource::Fallback,
        strategy: IntegrationStrategy::SingleSource,
        similarity_score: None,
        processing_ms: 0.0,
        metadata,
    }
}

/// Token-set Jaccard similarity over lowercased alphanumeric tokens.
///
/// Symmetric, in [0, 1], linear in input length. Two empty texts count
/// as identical.
pub fn token_jaccard(a: &str, b: &str) -> f32 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect()
    };
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

/// Drop the longest word-level prefix of `addition` that is already a
/// suffix of `base`, returning the remaining tail of `addition`.
fn strip_leading_overlap(base: &str, addition: &str) -> String {
    let base_words: Vec<&str> = base.split_whitespace().collect();
    let add_words: Vec<&str> = addition.split_whitespace().collect();
    let max_overlap = base_words.len().min(add_words.len());

    for overlap in (1..=max_overlap).rev() {
        let base_tail = &base_words[base_words.len() - overlap..];
        let add_head = &add_words[..overlap];
        let matches = base_tail
            .iter()
            .zip(add_head.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y));
        if matches {
            return add_words[overlap..].join(" ");
        }
    }
    addition.trim().to_owned()
}
