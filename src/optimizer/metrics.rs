//! Per-request performance metrics and their bounded rings.

use crate::routing::ProcessingPath;
use crate::tracks::TrackErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// One completed request's measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    /// Completion timestamp.
    pub timestamp: DateTime<Utc>,
    /// Path the request took.
    pub path: ProcessingPath,
    /// Request identifier.
    pub request_id: String,
    /// End-to-end latency in milliseconds.
    pub latency_ms: f64,
    /// Tokens used across the request.
    pub tokens: u32,
    /// Process resident memory at completion, in MiB.
    pub memory_mb: f64,
    /// System CPU utilization at completion.
    pub cpu_percent: f32,
    /// GPU memory in MiB, when known.
    pub gpu_memory_mb: Option<f64>,
    /// Heuristic quality score, when computed.
    pub quality_score: Option<f32>,
    /// Estimated cost in USD.
    pub cost_estimate: f64,
    /// Whether the request succeeded.
    pub success: bool,
    /// Failure kind when unsuccessful.
    pub error_kind: Option<TrackErrorKind>,
}

/// Fixed-capacity ring of metrics. Push is O(1) and evicts the oldest
/// entry at capacity.
#[derive(Debug, Clone)]
pub struct MetricsRing {
    capacity: usize,
    entries: VecDeque<PerformanceMetric>,
}

impl MetricsRing {
    /// Create a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Record a metric, evicting the oldest when full.
    pub fn push(&mut self, metric: PerformanceMetric) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(metric);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the stored entries, oldest first.
    pub fn snapshot(&self) -> Vec<PerformanceMetric> {
        self.entries.iter().cloned().collect()
    }

    /// Summary over the stored entries.
    pub fn summary(&self) -> MetricsSummary {
        summarize(self.entries.iter())
    }

    /// Median latency over stored entries, if any.
    pub fn median_latency_ms(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let mut latencies: Vec<f64> = self.entries.iter().map(|m| m.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));
        let mid = latencies.len() / 2;
        Some(if latencies.len() % 2 == 0 {
            (latencies[mid - 1] + latencies[mid]) / 2.0
        } else {
            latencies[mid]
        })
    }
}

/// Aggregate view over a set of metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Number of requests observed.
    pub count: usize,
    /// Fraction of successful requests.
    pub success_rate: f32,
    /// Mean latency in milliseconds.
    pub mean_latency_ms: f64,
    /// Minimum latency in milliseconds.
    pub min_latency_ms: f64,
    /// Maximum latency in milliseconds.
    pub max_latency_ms: f64,
    /// Mean quality over entries that carried a score.
    pub mean_quality: Option<f32>,
    /// Mean estimated cost in USD.
    pub mean_cost: f64,
    /// Error rate per failure kind.
    pub error_rate_by_kind: BTreeMap<String, f32>,
}

/// Summarize an iterator of metrics.
pub fn summarize<'a, I>(metrics: I) -> MetricsSummary
where
    I: Iterator<Item = &'a PerformanceMetric>,
{
    let mut count = 0usize;
    let mut successes = 0usize;
    let mut latency_sum = 0.0f64;
    let mut min_latency = f64::INFINITY;
    let mut max_latency = 0.0f64;
    let mut quality_sum = 0.0f32;
    let mut quality_count = 0usize;
    let mut cost_sum = 0.0f64;
    let mut error_counts: BTreeMap<String, usize> = BTreeMap::new();

    for metric in metrics {
        count += 1;
        if metric.success {
            successes += 1;
        }
        latency_sum += metric.latency_ms;
        min_latency = min_latency.min(metric.latency_ms);
        max_latency = max_latency.max(metric.latency_ms);
        if let Some(q) = metric.quality_score {
            quality_sum += q;
            quality_count += 1;
        }
        cost_sum += metric.cost_estimate;
        if let Some(kind) = metric.error_kind {
            let key = serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| format!("{kind:?}"));
            *error_counts.entry(key).or_default() += 1;
        }
    }

    if count == 0 {
        return MetricsSummary::default();
    }

    MetricsSummary {
        count,
        success_rate: successes as f32 / count as f32,
        mean_latency_ms: latency_sum / count as f64,
        min_latency_ms: min_latency,
        max_latency_ms: max_latency,
        mean_quality: (quality_count > 0).then(|| quality_sum / quality_count as f32),
        mean_cost: cost_sum / count as f64,
        error_rate_by_kind: error_counts
            .into_iter()
            .map(|(k, n)| (k, n as f32 / count as f32))
            .collect(),
    }
}

/// Global plus per-path rings.
#[derive(Debug)]
pub struct MetricsStore {
    all: MetricsRing,
    local: MetricsRing,
    api: MetricsRing,
    parallel: MetricsRing,
    staged: MetricsRing,
}

impl MetricsStore {
    /// Create a store with the given per-ring capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            all: MetricsRing::new(capacity),
            local: MetricsRing::new(capacity),
            api: MetricsRing::new(capacity),
            parallel: MetricsRing::new(capacity),
            staged: MetricsRing::new(capacity),
        }
    }

    /// Record one metric in the global ring and its path ring.
    pub fn record(&mut self, metric: PerformanceMetric) {
        self.ring_mut(metric.path).push(metric.clone());
        self.all.push(metric);
    }

    /// The ring for one path.
    pub fn ring(&self, path: ProcessingPath) -> &MetricsRing {
        match path {
            ProcessingPath::Local => &self.local,
            ProcessingPath::Api => &self.api,
            ProcessingPath::Parallel => &self.parallel,
            ProcessingPath::Staged => &self.staged,
        }
    }

    /// The global ring.
    pub fn all(&self) -> &MetricsRing {
        &self.all
    }

    /// Summary for one path, or the global summary.
    pub fn summary(&self, path: Option<ProcessingPath>) -> MetricsSummary {
        match path {
            Some(p) => self.ring(p).summary(),
            None => self.all.summary(),
        }
    }

    fn ring_mut(&mut self, path: ProcessingPath) -> &mut MetricsRing {
        match path {
            ProcessingPath::Local => &mut self.local,
            ProcessingPath::Api => &mut self.api,
            ProcessingPath::Parallel => &mut self.parallel,
            ProcessingPath::Staged => &mut self.staged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(path: ProcessingPath, latency: f64, success: bool) -> PerformanceMetric {
        PerformanceMetric {
            timestamp: Utc::now(),
            path,
            request_id: "r".to_owned(),
            latency_ms: latency,
            tokens: 10,
            memory_mb: 100.0,
            cpu_percent: 10.0,
            gpu_memory_mb: None,
            quality_score: Some(0.8),
            cost_estimate: 0.001,
            success,
            error_kind: (!success).then_some(TrackErrorKind::Timeout),
        }
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let mut ring = MetricsRing::new(3);
        for i in 0..5 {
            ring.push(metric(ProcessingPath::Local, i as f64, true));
        }
        assert_eq!(ring.len(), 3);
        let latencies: Vec<f64> = ring.snapshot().iter().map(|m| m.latency_ms).collect();
        assert_eq!(latencies, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn summary_computes_rates_and_bounds() {
        let mut ring = MetricsRing::new(10);
        ring.push(metric(ProcessingPath::Api, 100.0, true));
        ring.push(metric(ProcessingPath::Api, 300.0, false));
        let summary = ring.summary();
        assert_eq!(summary.count, 2);
        assert!((summary.success_rate - 0.5).abs() < f32::EPSILON);
        assert_eq!(summary.mean_latency_ms, 200.0);
        assert_eq!(summary.min_latency_ms, 100.0);
        assert_eq!(summary.max_latency_ms, 300.0);
        assert_eq!(summary.error_rate_by_kind.get("timeout"), Some(&0.5));
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let ring = MetricsRing::new(4);
        let summary = ring.summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn median_latency_even_and_odd() {
        let mut ring = MetricsRing::new(10);
        assert!(ring.median_latency_ms().is_none());
        ring.push(metric(ProcessingPath::Local, 10.0, true));
        ring.push(metric(ProcessingPath::Local, 30.0, true));
        assert_eq!(ring.median_latency_ms(), Some(20.0));
        ring.push(metric(ProcessingPath::Local, 100.0, true));
        assert_eq!(ring.median_latency_ms(), Some(30.0));
    }

    #[test]
    fn store_routes_to_path_rings() {
        let mut store = MetricsStore::new(10);
        store.record(metric(ProcessingPath::Local, 50.0, true));
        store.record(metric(ProcessingPath::Api, 500.0, true));
        assert_eq!(store.ring(ProcessingPath::Local).len(), 1);
        assert_eq!(store.ring(ProcessingPath::Api).len(), 1);
        assert_eq!(store.all().len(), 2);
        assert_eq!(store.summary(Some(ProcessingPath::Local)).count, 1);
        assert_eq!(store.summary(None).count, 2);
    }
}
