//! Shared types for the two inference tracks (on-device and remote).

use crate::config::LocalModelConfig;
use crate::error::AssistantError;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::{Duration, Instant};

pub mod local;
pub mod prompt;
pub mod remote;

pub use local::{LocalBackend, LocalBackendStats, LocalController};
pub use remote::RemoteController;

/// Which track produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    /// On-device model.
    Local,
    /// Remote model over HTTP.
    Api,
}

/// Failure kinds surfaced by track responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackErrorKind {
    // Local track.
    /// The backend was never loaded.
    NotInitialized,
    /// The model file could not be resolved through the registry.
    ModelNotFound,
    /// Inference failed mid-generation.
    GenerationFailed,
    /// The runtime ran out of memory or compute budget.
    ResourceExhausted,
    /// Prompt tokenization failed.
    Tokenization,
    // Remote track.
    /// The transport timed out below the deadline.
    NetworkTimeout,
    /// 5xx or connection-level failure.
    ServiceUnavailable,
    /// Invalid or missing API key.
    AuthFailed,
    /// The provider throttled the request.
    RateLimited,
    /// The request was rejected as malformed.
    ValidationError,
    /// The response body could not be parsed.
    ResponseMalformed,
    // Either track.
    /// The call's deadline was breached.
    Timeout,
    /// The turn was aborted by user interruption.
    Cancelled,
}

impl TrackErrorKind {
    /// Whether a remote request with this failure is worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout | Self::ServiceUnavailable | Self::RateLimited
        )
    }
}

/// The outcome of running one track for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackResponse {
    /// Generated text (may be non-empty even on timeout).
    pub content: String,
    /// Whether generation completed normally.
    pub success: bool,
    /// Failure kind when `success` is false.
    pub error_kind: Option<TrackErrorKind>,
    /// Tokens generated.
    pub tokens_used: u32,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: f64,
    /// Estimated cost in USD (zero for the local track).
    pub cost_estimate: f64,
    /// Heuristic quality score in [0, 1], when computable.
    pub quality_score: Option<f32>,
    /// Why generation stopped ("stop", "length", "timeout", "error").
    pub finish_reason: String,
    /// Producing track.
    pub source: TrackSource,
}

impl TrackResponse {
    /// A failed response with no content.
    pub fn failure(source: TrackSource, kind: TrackErrorKind, latency_ms: f64) -> Self {
        Self {
            content: String::new(),
            success: false,
            error_kind: Some(kind),
            tokens_used: 0,
            latency_ms,
            cost_estimate: 0.0,
            quality_score: None,
            finish_reason: "error".to_owned(),
            source,
        }
    }

    /// Whether this response satisfies the STAGED sufficiency check.
    pub fn is_sufficient(&self, min_tokens: u32) -> bool {
        self.success && self.tokens_used >= min_tokens && !self.content.trim().is_empty()
    }
}

/// Sampling parameters shared by both controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Top-k sampling cutoff (local only).
    pub top_k: u32,
    /// Repetition penalty (local only).
    pub repeat_penalty: f32,
    /// Stop sequences terminating generation.
    pub stop_sequences: Vec<String>,
}

impl GenerationParams {
    /// Parameters derived from the local model config section.
    pub fn from_local(config: &LocalModelConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repeat_penalty,
            stop_sequences: config.stop_sequences.clone(),
        }
    }
}

/// One increment of a streaming generation.
///
/// `tokens_so_far` increases monotonically; the terminal chunk carries
/// `finish_reason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// New text since the previous chunk.
    pub content: String,
    /// Cumulative token count.
    pub tokens_so_far: u32,
    /// Present only on the terminal chunk.
    pub finish_reason: Option<String>,
}

/// A boxed stream of generation chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AssistantError>> + Send>>;

/// Time remaining before `deadline`, or `None` when already past it.
pub fn time_remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline - now)
    }
}

/// Crude quality heuristic: completed generations with substantive
/// content score higher. Used only as a tie-breaker signal for the
/// optimizer; never user-visible.
pub fn estimate_quality(content: &str, finish_reason: &str) -> f32 {
    let len_score = (content.split_whitespace().count() as f32 / 50.0).min(1.0);
    let finish_score = if finish_reason == "stop" { 1.0 } else { 0.5 };
    (0.6 * len_score + 0.4 * finish_score).clamp(0.0, 1.0)
}
