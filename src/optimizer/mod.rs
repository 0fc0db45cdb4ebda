//! Feedback-driven optimization of routing, timeouts, and local tuning.
//!
//! The optimizer collects per-request metrics and resource samples, and
//! periodically nudges routing preferences toward whatever the recent
//! evidence supports. Every adjustment is bounded per step so the
//! router's behavior drifts instead of thrashing.

use crate::config::{OptimizationStrategy, OptimizerConfig, ResourceConstraints};
use crate::routing::{LatencyEstimates, ProcessingPath, RoutingPreferences};
use crate::tracks::{TrackResponse, local::LocalTuning};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod metrics;
pub mod resources;

pub use metrics::{MetricsStore, MetricsSummary, PerformanceMetric};
pub use resources::{ConstraintViolation, ResourceReader, ResourceMonitor, ResourceUsage};

/// Largest change to any preference in one adaptation pass.
const MAX_STEP: f32 = 0.1;

/// Largest change to the timeout multiplier in one adaptation pass.
const MAX_TIMEOUT_STEP: f32 = 0.25;

/// Minimum samples in a ring before its summary drives adaptation.
const MIN_SAMPLES: usize = 5;

/// Retained adaptation records.
const ADAPTATION_HISTORY: usize = 20;

/// Error rate of deadline breaches above which timeouts grow.
const TIMEOUT_PRESSURE_RATE: f32 = 0.2;

/// One adaptation pass and what it changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationRecord {
    /// When the pass ran.
    pub adapt_time: DateTime<Utc>,
    /// Human-readable descriptions of each change.
    pub changes: Vec<String>,
}

/// Process-wide optimizer state (spec'd snapshot shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationState {
    /// Active strategy.
    pub strategy: OptimizationStrategy,
    /// Configured resource limits.
    pub constraints: ResourceConstraints,
    /// Current routing preferences.
    pub routing_preferences: RoutingPreferences,
    /// When the last adaptation pass ran.
    pub last_adapt_time: Option<DateTime<Utc>>,
    /// Total adaptation passes.
    pub adapt_count: u64,
    /// Recent adaptation records, newest last.
    pub recent_adaptations: Vec<AdaptationRecord>,
}

/// Recommended per-call deadlines, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecommendedTimeouts {
    /// Local track deadline.
    pub local_ms: u64,
    /// API track deadline.
    pub api_ms: u64,
    /// Per-track deadline when both run in parallel.
    pub parallel_ms: u64,
}

/// Current resource posture attached to recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Latest usage sample.
    pub usage: ResourceUsage,
    /// Constraints the sample violates.
    pub violations: Vec<ConstraintViolation>,
    /// Whether running both tracks at once is currently acceptable.
    pub allow_parallel: bool,
}

/// Response-caching advice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingAdvice {
    /// Whether callers should consult a response cache.
    pub enabled: bool,
    /// Why.
    pub reason: String,
}

/// Everything the scheduler needs from the optimizer for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendations {
    /// Tuned routing preferences.
    pub routing_preferences: RoutingPreferences,
    /// Resource posture.
    pub resource_status: ResourceStatus,
    /// Per-call deadlines.
    pub timeouts: RecommendedTimeouts,
    /// Caching advice.
    pub caching: CachingAdvice,
}

struct PendingRequest {
    started: Instant,
    #[allow(dead_code)]
    context: Map<String, Value>,
}

/// Per-strategy weighting of the adaptation heuristics.
struct HeuristicWeights {
    reliability: f32,
    latency: f32,
    resource: f32,
    quality: f32,
}

/// Collects metrics and adapts routing preferences on an interval.
pub struct DualTrackOptimizer {
    config: OptimizerConfig,
    base_local_timeout_ms: u64,
    base_api_timeout_ms: u64,
    priors: LatencyEstimates,
    metrics: Mutex<MetricsStore>,
    state: RwLock<OptimizationState>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    resources: ResourceReader,
}

impl DualTrackOptimizer {
    /// Create an optimizer over the given resource reader.
    pub fn new(
        config: OptimizerConfig,
        base_local_timeout_ms: u64,
        base_api_timeout_ms: u64,
        priors: LatencyEstimates,
        resources: ResourceReader,
    ) -> Self {
        let state = OptimizationState {
            strategy: config.strategy,
            constraints: config.constraints.clone(),
            routing_preferences: RoutingPreferences::default(),
            last_adapt_time: None,
            adapt_count: 0,
            recent_adaptations: Vec::new(),
        };
        Self {
            metrics: Mutex::new(MetricsStore::new(config.metrics_window)),
            state: RwLock::new(state),
            pending: Mutex::new(HashMap::new()),
            base_local_timeout_ms,
            base_api_timeout_ms,
            priors,
            config,
            resources,
        }
    }

    /// Seed the starting routing preferences (config-derived defaults).
    pub fn with_initial_preferences(self, preferences: RoutingPreferences) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.routing_preferences = preferences;
        }
        self
    }

    /// Note that a request began. `context` is carried for diagnostics.
    pub fn record_request_start(&self, id: &str, query: &str, context: Map<String, Value>) {
        debug!(id, query_words = query.split_whitespace().count(), "request started");
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id.to_owned(),
                PendingRequest {
                    started: Instant::now(),
                    context,
                },
            );
        }
    }

    /// Record the outcome of a completed request.
    ///
    /// The metric carries the track's own latency; the pending entry
    /// only bounds how long the request was outstanding (parallel turns
    /// report the same id once per track).
    pub fn record_request_completion(
        &self,
        id: &str,
        path: ProcessingPath,
        response: &TrackResponse,
    ) {
        if let Ok(mut pending) = self.pending.lock()
            && let Some(p) = pending.remove(id)
        {
            debug!(
                id,
                outstanding_ms = p.started.elapsed().as_millis() as u64,
                "request settled"
            );
        }
        let usage = self.resources.current();
        let metric = PerformanceMetric {
            timestamp: Utc::now(),
            path,
            request_id: id.to_owned(),
            latency_ms: response.latency_ms,
            tokens: response.tokens_used,
            memory_mb: usage.process_memory_mb,
            cpu_percent: usage.cpu_percent.unwrap_or(0.0),
            gpu_memory_mb: usage.gpu_memory_mb,
            quality_score: response.quality_score,
            cost_estimate: response.cost_estimate,
            success: response.success,
            error_kind: response.error_kind,
        };
        if let Ok(mut store) = self.metrics.lock() {
            store.record(metric);
        }
    }

    /// Rolling latency medians for the router, with priors as fallback.
    pub fn latency_estimates(&self) -> LatencyEstimates {
        let store = match self.metrics.lock() {
            Ok(s) => s,
            Err(_) => return self.priors,
        };
        LatencyEstimates {
            local_ms: store
                .ring(ProcessingPath::Local)
                .median_latency_ms()
                .unwrap_or(self.priors.local_ms),
            api_ms: store
                .ring(ProcessingPath::Api)
                .median_latency_ms()
                .unwrap_or(self.priors.api_ms),
        }
    }

    /// Snapshot of the current routing preferences.
    pub fn preferences(&self) -> RoutingPreferences {
        self.state
            .read()
            .map(|s| s.routing_preferences)
            .unwrap_or_default()
    }

    /// Current recommendations for one request.
    pub fn get_optimization_recommendations(&self) -> Recommendations {
        let preferences = self.preferences();
        let usage = self.resources.current();
        let violations = resources::check_constraints(&usage, &self.config.constraints);
        let allow_parallel = resources::allows_parallel(&usage, &self.config.constraints);

        let multiplier = f64::from(preferences.timeout_multiplier.clamp(0.5, 3.0));
        let local_ms = (self.base_local_timeout_ms as f64 * multiplier) as u64;
        let api_ms = (self.base_api_timeout_ms as f64 * multiplier) as u64;

        let caching = match self.config.strategy {
            OptimizationStrategy::CostOptimized | OptimizationStrategy::ResourceEfficient => {
                CachingAdvice {
                    enabled: true,
                    reason: "strategy favors avoiding repeat inference".to_owned(),
                }
            }
            _ => CachingAdvice {
                enabled: false,
                reason: "latency and quality strategies bypass the cache".to_owned(),
            },
        };

        Recommendations {
            routing_preferences: preferences,
            resource_status: ResourceStatus {
                usage,
                violations,
                allow_parallel,
            },
            timeouts: RecommendedTimeouts {
                local_ms,
                api_ms,
                parallel_ms: local_ms.max(api_ms),
            },
            caching,
        }
    }

    /// Metric summary for one path, or globally.
    pub fn get_metrics_summary(&self, path: Option<ProcessingPath>) -> MetricsSummary {
        self.metrics
            .lock()
            .map(|s| s.summary(path))
            .unwrap_or_default()
    }

    /// Snapshot of the optimizer's state.
    pub fn get_optimization_status(&self) -> OptimizationState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| OptimizationState {
                strategy: self.config.strategy,
                constraints: self.config.constraints.clone(),
                routing_preferences: RoutingPreferences::default(),
                last_adapt_time: None,
                adapt_count: 0,
                recent_adaptations: Vec::new(),
            })
    }

    /// Tuning hints for the local controller under current pressure.
    pub fn local_tuning(&self) -> LocalTuning {
        let usage = self.resources.current();
        let violations = resources::check_constraints(&usage, &self.config.constraints);
        let memory_pressed = violations
            .iter()
            .any(|v| matches!(v, ConstraintViolation::MemoryExceeded { .. }));
        if memory_pressed {
            LocalTuning {
                batch_size: Some(128),
                low_vram: Some(true),
                ..LocalTuning::default()
            }
        } else {
            LocalTuning::default()
        }
    }

    /// Run one adaptation pass. Returns descriptions of the changes made.
    pub fn adapt_once(&self) -> Vec<String> {
        let (local_summary, api_summary, timeout_rate) = match self.metrics.lock() {
            Ok(store) => {
                let all = store.summary(None);
                let timeout_rate = all
                    .error_rate_by_kind
                    .get("timeout")
                    .copied()
                    .unwrap_or(0.0)
                    + all
                        .error_rate_by_kind
                        .get("network_timeout")
                        .copied()
                        .unwrap_or(0.0);
                (
                    store.summary(Some(ProcessingPath::Local)),
                    store.summary(Some(ProcessingPath::Api)),
                    timeout_rate,
                )
            }
            Err(_) => return Vec::new(),
        };
        let usage = self.resources.current();
        let violations = resources::check_constraints(&usage, &self.config.constraints);
        let weights = self.heuristic_weights(&local_summary);

        let mut bias_delta = 0.0f32;
        let mut parallel_delta = 0.0f32;
        let mut quality_delta = 0.0f32;
        let mut timeout_delta = 0.0f32;
        let mut changes = Vec::new();

        if api_summary.count >= MIN_SAMPLES && api_summary.success_rate < self.config.min_api_success
        {
            bias_delta += MAX_STEP * weights.reliability;
            changes.push(format!(
                "api success {:.2} below {:.2}: raising local bias",
                api_summary.success_rate, self.config.min_api_success
            ));
        }

        if local_summary.count >= MIN_SAMPLES
            && local_summary.mean_latency_ms > self.config.constraints.target_latency_ms
        {
            bias_delta -= MAX_STEP * weights.latency;
            parallel_delta += MAX_STEP * weights.latency;
            changes.push(format!(
                "local mean latency {:.0}ms over target {:.0}ms: favoring API",
                local_summary.mean_latency_ms, self.config.constraints.target_latency_ms
            ));
        }

        let pressured = violations.iter().any(|v| {
            matches!(
                v,
                ConstraintViolation::CpuExceeded { .. } | ConstraintViolation::BatteryLow { .. }
            )
        });
        if pressured {
            parallel_delta += MAX_STEP * weights.resource;
            bias_delta -= MAX_STEP * weights.resource * 0.5;
            changes.push("resource pressure: discouraging parallel processing".to_owned());
        }

        if let (Some(api_quality), Some(local_quality)) =
            (api_summary.mean_quality, local_summary.mean_quality)
        {
            if api_quality - local_quality > self.config.quality_gap_threshold {
                bias_delta -= MAX_STEP * weights.quality;
                quality_delta += MAX_STEP * weights.quality * 0.5;
                changes.push(format!(
                    "quality gap {:.2}: favoring API answers",
                    api_quality - local_quality
                ));
            }
        }

        if timeout_rate > TIMEOUT_PRESSURE_RATE {
            timeout_delta += MAX_TIMEOUT_STEP;
            changes.push(format!(
                "timeout rate {timeout_rate:.2}: extending deadlines"
            ));
        }

        if changes.is_empty() {
            return changes;
        }

        // Bound each preference's total movement per pass, then clamp to
        // its legal range.
        if let Ok(mut state) = self.state.write() {
            let prefs = &mut state.routing_preferences;
            prefs.local_bias =
                (prefs.local_bias + bias_delta.clamp(-MAX_STEP, MAX_STEP)).clamp(0.0, 1.0);
            prefs.parallel_threshold = (prefs.parallel_threshold
                + parallel_delta.clamp(-MAX_STEP, MAX_STEP))
            .clamp(0.3, 0.9);
            prefs.quality_threshold =
                (prefs.quality_threshold + quality_delta.clamp(-MAX_STEP, MAX_STEP)).clamp(0.0, 1.0);
            prefs.timeout_multiplier = (prefs.timeout_multiplier
                + timeout_delta.clamp(-MAX_TIMEOUT_STEP, MAX_TIMEOUT_STEP))
            .clamp(0.5, 3.0);

            state.last_adapt_time = Some(Utc::now());
            state.adapt_count += 1;
            state.recent_adaptations.push(AdaptationRecord {
                adapt_time: Utc::now(),
                changes: changes.clone(),
            });
            if state.recent_adaptations.len() > ADAPTATION_HISTORY {
                let excess = state.recent_adaptations.len() - ADAPTATION_HISTORY;
                state.recent_adaptations.drain(..excess);
            }
            info!(count = state.adapt_count, ?changes, "adaptation applied");
        }
        changes
    }

    /// Run the adaptation loop until cancelled.
    pub async fn run(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.adaptation_interval_s.max(1));
        info!(interval_s = interval.as_secs(), "adaptive optimizer started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("adaptive optimizer stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    self.adapt_once();
                }
            }
        }
    }

    /// Strategy-dependent heuristic weights. `ADAPTIVE` leans into the
    /// latency heuristic as the recent targets-met rate drops.
    fn heuristic_weights(&self, local_summary: &MetricsSummary) -> HeuristicWeights {
        match self.config.strategy {
            OptimizationStrategy::LatencyFocused => HeuristicWeights {
                reliability: 0.5,
                latency: 1.0,
                resource: 0.5,
                quality: 0.25,
            },
            OptimizationStrategy::ResourceEfficient => HeuristicWeights {
                reliability: 0.5,
                latency: 0.5,
                resource: 1.0,
                quality: 0.25,
            },
            OptimizationStrategy::QualityFocused => HeuristicWeights {
                reliability: 0.5,
                latency: 0.25,
                resource: 0.5,
                quality: 1.0,
            },
            OptimizationStrategy::CostOptimized => HeuristicWeights {
                reliability: 1.0,
                latency: 0.25,
                resource: 1.0,
                quality: 0.25,
            },
            OptimizationStrategy::Adaptive => {
                let target = self.config.constraints.target_latency_ms;
                let latency_weight = if local_summary.count >= MIN_SAMPLES && target > 0.0 {
                    // 0.5 when comfortably under target, up to 1.5 when over.
                    (local_summary.mean_latency_ms / target).clamp(0.5, 1.5) as f32
                } else {
                    1.0
                };
                HeuristicWeights {
                    reliability: 1.0,
                    latency: latency_weight,
                    resource: 1.0,
                    quality: 1.0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::{TrackErrorKind, TrackSource};

    fn optimizer(config: OptimizerConfig) -> DualTrackOptimizer {
        DualTrackOptimizer::new(
            config,
            6_000,
            12_000,
            LatencyEstimates {
                local_ms: 800.0,
                api_ms: 2_000.0,
            },
            ResourceReader::disabled(),
        )
    }

    fn response(success: bool, latency_ms: f64, quality: Option<f32>) -> TrackResponse {
        TrackResponse {
            content: "x".to_owned(),
            success,
            error_kind: (!success).then_some(TrackErrorKind::ServiceUnavailable),
            tokens_used: 5,
            latency_ms,
            cost_estimate: 0.001,
            quality_score: quality,
            finish_reason: "stop".to_owned(),
            source: TrackSource::Api,
        }
    }

    #[test]
    fn latency_estimates_fall_back_to_priors() {
        let opt = optimizer(OptimizerConfig::default());
        let estimates = opt.latency_estimates();
        assert_eq!(estimates.local_ms, 800.0);
        assert_eq!(estimates.api_ms, 2_000.0);
    }

    #[test]
    fn latency_estimates_use_recorded_medians() {
        let opt = optimizer(OptimizerConfig::default());
        for latency in [100.0, 200.0, 300.0] {
            opt.record_request_completion(
                "r",
                ProcessingPath::Local,
                &response(true, latency, None),
            );
        }
        assert_eq!(opt.latency_estimates().local_ms, 200.0);
    }

    #[test]
    fn api_failures_raise_local_bias() {
        let opt = optimizer(OptimizerConfig::default());
        let before = opt.preferences().local_bias;
        for i in 0..8 {
            opt.record_request_completion(
                &format!("r{i}"),
                ProcessingPath::Api,
                &response(false, 500.0, None),
            );
        }
        let changes = opt.adapt_once();
        assert!(!changes.is_empty());
        let after = opt.preferences().local_bias;
        assert!(after > before);
        // Bounded per-step movement.
        assert!(after - before <= MAX_STEP + f32::EPSILON);
    }

    #[test]
    fn slow_local_lowers_bias_and_raises_parallel_threshold() {
        let opt = optimizer(OptimizerConfig::default());
        for i in 0..8 {
            opt.record_request_completion(
                &format!("r{i}"),
                ProcessingPath::Local,
                &response(true, 10_000.0, None),
            );
        }
        let before = opt.get_optimization_status().routing_preferences;
        opt.adapt_once();
        let after = opt.get_optimization_status().routing_preferences;
        assert!(after.local_bias < before.local_bias);
        assert!(after.parallel_threshold > before.parallel_threshold);
    }

    #[test]
    fn no_data_means_no_adaptation() {
        let opt = optimizer(OptimizerConfig::default());
        assert!(opt.adapt_once().is_empty());
        assert_eq!(opt.get_optimization_status().adapt_count, 0);
    }

    #[test]
    fn quality_gap_favors_api() {
        let opt = optimizer(OptimizerConfig::default());
        for i in 0..6 {
            opt.record_request_completion(
                &format!("a{i}"),
                ProcessingPath::Api,
                &response(true, 500.0, Some(0.95)),
            );
            opt.record_request_completion(
                &format!("l{i}"),
                ProcessingPath::Local,
                &response(true, 500.0, Some(0.4)),
            );
        }
        let before = opt.preferences().local_bias;
        opt.adapt_once();
        assert!(opt.preferences().local_bias < before);
    }

    #[test]
    fn timeout_pressure_extends_deadlines() {
        let opt = optimizer(OptimizerConfig::default());
        for i in 0..10 {
            let mut resp = response(i >= 5, 500.0, None);
            if i < 5 {
                resp.error_kind = Some(TrackErrorKind::Timeout);
            }
            opt.record_request_completion(&format!("r{i}"), ProcessingPath::Api, &resp);
        }
        let before = opt.get_optimization_recommendations().timeouts.api_ms;
        opt.adapt_once();
        let after = opt.get_optimization_recommendations().timeouts.api_ms;
        assert!(after > before);
    }

    #[test]
    fn recommendations_scale_timeouts_by_multiplier() {
        let opt = optimizer(OptimizerConfig::default());
        let rec = opt.get_optimization_recommendations();
        assert_eq!(rec.timeouts.local_ms, 6_000);
        assert_eq!(rec.timeouts.api_ms, 12_000);
        assert_eq!(rec.timeouts.parallel_ms, 12_000);
        assert!(rec.resource_status.allow_parallel);
    }

    #[test]
    fn adaptation_history_is_bounded() {
        let opt = optimizer(OptimizerConfig::default());
        for round in 0..30 {
            for i in 0..8 {
                opt.record_request_completion(
                    &format!("r{round}-{i}"),
                    ProcessingPath::Api,
                    &response(false, 500.0, None),
                );
            }
            opt.adapt_once();
        }
        let status = opt.get_optimization_status();
        assert!(status.recent_adaptations.len() <= ADAPTATION_HISTORY);
        assert!(status.adapt_count >= 20);
    }
}
