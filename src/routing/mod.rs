//! Query routing between the on-device and remote inference tracks.
//!
//! [`Router::determine_path`] is pure and deterministic: the same query,
//! context, config, and optimizer preferences always produce the same
//! [`RoutingDecision`]. Feature extraction and scoring are total — any
//! unexpected input shape falls back to the local track rather than
//! failing the turn.

use crate::config::{ActivationMode, RouterConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod features;

pub use features::QueryFeatures;

/// Which track(s) a turn uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPath {
    /// On-device model only.
    Local,
    /// Remote model only.
    Api,
    /// Both tracks concurrently.
    Parallel,
    /// Local first; escalate to the API if the local result is insufficient.
    Staged,
}

/// Routing preferences tuned by the adaptive optimizer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPreferences {
    /// Bias toward the local track in [0, 1]; 0.5 is neutral.
    pub local_bias: f32,
    /// Complexity score above which both tracks run in parallel.
    pub parallel_threshold: f32,
    /// Multiplier applied to configured track timeouts.
    pub timeout_multiplier: f32,
    /// Minimum acceptable quality score for a single-track answer.
    pub quality_threshold: f32,
}

impl Default for RoutingPreferences {
    fn default() -> Self {
        Self {
            local_bias: 0.5,
            parallel_threshold: 0.6,
            timeout_multiplier: 1.0,
            quality_threshold: 0.5,
        }
    }
}

/// Rolling latency estimates for each track, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LatencyEstimates {
    /// Expected local-track latency.
    pub local_ms: f64,
    /// Expected API-track latency.
    pub api_ms: f64,
}

/// Per-turn context consulted by the router.
#[derive(Debug, Clone)]
pub struct RouterContext {
    /// Current activation mode.
    pub activation_mode: ActivationMode,
    /// Whether the conversation has prior turns.
    pub has_history: bool,
    /// Whether current resource usage permits running both tracks at once.
    pub allow_parallel: bool,
    /// Optimizer-tuned preferences.
    pub preferences: RoutingPreferences,
    /// Rolling latency medians (priors when no history exists).
    pub latency: LatencyEstimates,
}

impl RouterContext {
    /// Context with neutral preferences and the given latency priors.
    pub fn with_priors(config: &RouterConfig) -> Self {
        Self {
            activation_mode: ActivationMode::Continuous,
            has_history: false,
            allow_parallel: true,
            preferences: RoutingPreferences::default(),
            latency: LatencyEstimates {
                local_ms: config.prior_local_latency_ms,
                api_ms: config.prior_api_latency_ms,
            },
        }
    }
}

/// The outcome of routing one query. Immutable once written into a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Chosen processing path.
    pub path: ProcessingPath,
    /// Distance from the decision boundary, clipped to [0.5, 0.99].
    pub confidence: f32,
    /// Short human-readable name of the rule that fired.
    pub reasoning: String,
    /// Extracted feature scores.
    pub features: BTreeMap<String, f32>,
    /// Expected local-track latency in milliseconds.
    pub estimated_local_ms: f64,
    /// Expected API-track latency in milliseconds.
    pub estimated_api_ms: f64,
}

impl RoutingDecision {
    fn fallback(latency: LatencyEstimates) -> Self {
        Self {
            path: ProcessingPath::Local,
            confidence: 0.5,
            reasoning: "router_fallback".to_owned(),
            features: BTreeMap::new(),
            estimated_local_ms: latency.local_ms,
            estimated_api_ms: latency.api_ms,
        }
    }
}

/// Classifies queries and decides which track(s) to run.
#[derive(Debug, Clone)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    /// Create a router with the given thresholds and weights.
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Decide the processing path for one query.
    ///
    /// Rules apply in order; the first match wins. Never fails: any
    /// degenerate input yields a local-track fallback decision.
    pub fn determine_path(&self, query: &str, context: &RouterContext) -> RoutingDecision {
        let trimmed = query.trim();
        if context.activation_mode == ActivationMode::Off || trimmed.is_empty() {
            return RoutingDecision::fallback(context.latency);
        }

        let features = QueryFeatures::extract(trimmed, context.has_history);
        let complexity = features.complexity(&self.config.weights);
        let creativity = features.creativity(&self.config.weights);

        let mut scores = features.as_map();
        scores.insert("complexity".to_owned(), complexity);
        scores.insert("creativity".to_owned(), creativity);

        let (path, confidence, reasoning) =
            self.apply_rules(&features, complexity, creativity, context);

        RoutingDecision {
            path,
            confidence,
            reasoning,
            features: scores,
            estimated_local_ms: context.latency.local_ms,
            estimated_api_ms: context.latency.api_ms,
        }
    }

    fn apply_rules(
        &self,
        features: &QueryFeatures,
        complexity: f32,
        creativity: f32,
        context: &RouterContext,
    ) -> (ProcessingPath, f32, String) {
        let cfg = &self.config;
        let prefs = &context.preferences;
        let words = features.word_count as f32;

        // Rule 2: very long or clearly creative queries go remote.
        if features.word_count > cfg.threshold_very_long {
            let margin = (words - cfg.threshold_very_long as f32) / cfg.threshold_very_long as f32;
            return (
                ProcessingPath::Api,
                confidence_from_margin(margin),
                "very_long_query".to_owned(),
            );
        }
        if creativity > cfg.creativity_api_threshold {
            let margin = creativity - cfg.creativity_api_threshold;
            return (
                ProcessingPath::Api,
                confidence_from_margin(margin),
                "creative_request".to_owned(),
            );
        }

        // Rule 3: short and simple stays on device.
        if features.word_count < cfg.threshold_simple && complexity < cfg.complexity_local_threshold
        {
            let margin = (cfg.complexity_local_threshold - complexity)
                .min((cfg.threshold_simple as f32 - words) / cfg.threshold_simple as f32);
            return (
                ProcessingPath::Local,
                confidence_from_margin(margin),
                "simple_query".to_owned(),
            );
        }

        // Rule 4: time-pressed queries favor responsiveness. A higher
        // local bias lowers the effective threshold.
        let ts_threshold = cfg.time_sensitivity_threshold * (1.5 - prefs.local_bias.clamp(0.0, 1.0));
        if features.time_sensitivity > ts_threshold {
            let margin = features.time_sensitivity - ts_threshold;
            return (
                ProcessingPath::Local,
                confidence_from_margin(margin),
                "time_sensitive".to_owned(),
            );
        }

        // Rule 5: complex queries run both tracks when resources allow.
        if complexity > prefs.parallel_threshold && context.allow_parallel {
            let margin = complexity - prefs.parallel_threshold;
            return (
                ProcessingPath::Parallel,
                confidence_from_margin(margin),
                "complex_parallel".to_owned(),
            );
        }

        // Rule 6: everything else runs local first with API escalation.
        let margin = (prefs.parallel_threshold - complexity).abs();
        (
            ProcessingPath::Staged,
            confidence_from_margin(margin * 0.5),
            "staged_default".to_owned(),
        )
    }
}

/// Map a boundary distance to a confidence in [0.5, 0.99].
fn confidence_from_margin(margin: f32) -> f32 {
    (0.5 + margin.abs()).clamp(0.5, 0.99)
}
