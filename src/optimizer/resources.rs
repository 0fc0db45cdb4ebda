//! Best-effort system resource sampling.
//!
//! Keep this dependency-free: read `/proc` on Linux and shell out to
//! `sysctl`/`ps` on macOS. Every probe returns `Option` and the monitor
//! degrades gracefully when a source is unavailable (containers, exotic
//! platforms).

use crate::config::ResourceConstraints;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A point-in-time resource snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Process resident memory in MiB.
    pub process_memory_mb: f64,
    /// System available memory in MiB, when known.
    pub available_memory_mb: Option<f64>,
    /// System CPU utilization percentage, when known.
    pub cpu_percent: Option<f32>,
    /// GPU memory in use in MiB, when known.
    pub gpu_memory_mb: Option<f64>,
    /// Battery charge percentage, when known.
    pub battery_percent: Option<f32>,
    /// Sample timestamp.
    pub sample_time: DateTime<Utc>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            process_memory_mb: 0.0,
            available_memory_mb: None,
            cpu_percent: None,
            gpu_memory_mb: None,
            battery_percent: None,
            sample_time: Utc::now(),
        }
    }
}

/// A constraint the current usage violates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConstraintViolation {
    /// Process memory exceeds `max_memory_mb`.
    MemoryExceeded { used_mb: f64, limit_mb: u64 },
    /// CPU utilization exceeds `max_cpu_percent`.
    CpuExceeded { used_percent: f32, limit_percent: f32 },
    /// GPU memory exceeds `max_gpu_memory_mb`.
    GpuMemoryExceeded { used_mb: f64, limit_mb: u64 },
    /// Battery below `battery_threshold_percent`.
    BatteryLow { percent: f32, threshold: f32 },
}

/// Compare a usage snapshot against the configured constraints.
pub fn check_constraints(
    usage: &ResourceUsage,
    constraints: &ResourceConstraints,
) -> Vec<ConstraintViolation> {
    let mut violations = Vec::new();
    if constraints.max_memory_mb > 0 && usage.process_memory_mb > constraints.max_memory_mb as f64 {
        violations.push(ConstraintViolation::MemoryExceeded {
            used_mb: usage.process_memory_mb,
            limit_mb: constraints.max_memory_mb,
        });
    }
    if let Some(cpu) = usage.cpu_percent {
        if constraints.max_cpu_percent > 0.0 && cpu > constraints.max_cpu_percent {
            violations.push(ConstraintViolation::CpuExceeded {
                used_percent: cpu,
                limit_percent: constraints.max_cpu_percent,
            });
        }
    }
    if let Some(gpu) = usage.gpu_memory_mb {
        if constraints.max_gpu_memory_mb > 0 && gpu > constraints.max_gpu_memory_mb as f64 {
            violations.push(ConstraintViolation::GpuMemoryExceeded {
                used_mb: gpu,
                limit_mb: constraints.max_gpu_memory_mb,
            });
        }
    }
    if let Some(battery) = usage.battery_percent {
        if battery < constraints.battery_threshold_percent {
            violations.push(ConstraintViolation::BatteryLow {
                percent: battery,
                threshold: constraints.battery_threshold_percent,
            });
        }
    }
    violations
}

/// Whether current usage leaves budget for running both tracks at once.
pub fn allows_parallel(usage: &ResourceUsage, constraints: &ResourceConstraints) -> bool {
    check_constraints(usage, constraints)
        .iter()
        .all(|v| !matches!(
            v,
            ConstraintViolation::CpuExceeded { .. } | ConstraintViolation::BatteryLow { .. }
        ))
}

/// Periodic resource sampler.
///
/// Runs as a long-lived task started at boot; each iteration consults
/// the stop token, so shutdown joins cleanly.
pub struct ResourceMonitor {
    snapshot: Arc<RwLock<ResourceUsage>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ResourceMonitor {
    /// Create a monitor sampling every `interval`.
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(ResourceUsage::default())),
            interval,
            cancel,
        }
    }

    /// Handle for reading the latest sample.
    pub fn reader(&self) -> ResourceReader {
        ResourceReader {
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    /// Run the sampling loop until cancelled.
    pub async fn run(self) {
        info!(interval_s = self.interval.as_secs(), "resource monitor started");
        let mut cpu_tracker = CpuTracker::default();
        loop {
            let usage = sample(&mut cpu_tracker);
            debug!(
                rss_mb = usage.process_memory_mb,
                cpu = ?usage.cpu_percent,
                "resource sample"
            );
            if let Ok(mut slot) = self.snapshot.write() {
                *slot = usage;
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("resource monitor stopped");
                    return;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Shared read handle onto the monitor's latest sample.
#[derive(Debug, Clone)]
pub struct ResourceReader {
    snapshot: Arc<RwLock<ResourceUsage>>,
}

impl ResourceReader {
    /// A reader that always returns the default (empty) sample. Used
    /// when monitoring is disabled.
    pub fn disabled() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(ResourceUsage::default())),
        }
    }

    /// The latest sample.
    pub fn current(&self) -> ResourceUsage {
        self.snapshot
            .read()
            .map(|u| u.clone())
            .unwrap_or_default()
    }
}

/// Take one full sample.
fn sample(cpu: &mut CpuTracker) -> ResourceUsage {
    ResourceUsage {
        process_memory_mb: process_rss_mb().unwrap_or(0.0),
        available_memory_mb: available_memory_mb(),
        cpu_percent: cpu.sample(),
        gpu_memory_mb: None,
        battery_percent: battery_percent(),
        sample_time: Utc::now(),
    }
}

/// Resident set size of this process, in MiB.
pub fn process_rss_mb() -> Option<f64> {
    if cfg!(target_os = "linux") {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: f64 = rest.split_whitespace().next()?.parse().ok()?;
                return Some(kb / 1024.0);
            }
        }
        return None;
    }
    if cfg!(target_os = "macos") {
        let pid = std::process::id().to_string();
        let out = run_cmd(&["ps", "-o", "rss=", "-p", &pid])?;
        let kb: f64 = out.trim().parse().ok()?;
        return Some(kb / 1024.0);
    }
    None
}

/// System available memory, in MiB.
fn available_memory_mb() -> Option<f64> {
    if cfg!(target_os = "linux") {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kb: f64 = rest.split_whitespace().next()?.parse().ok()?;
                return Some(kb / 1024.0);
            }
        }
        return None;
    }
    if cfg!(target_os = "macos") {
        let bytes = run_cmd(&["sysctl", "-n", "hw.memsize"])?;
        let total: f64 = bytes.trim().parse().ok()?;
        // No cheap "available" figure on macOS; report total as an upper bound.
        return Some(total / (1024.0 * 1024.0));
    }
    None
}

/// Battery percentage (Linux sysfs only; absent elsewhere).
fn battery_percent() -> Option<f32> {
    if cfg!(target_os = "linux") {
        let raw = std::fs::read_to_string("/sys/class/power_supply/BAT0/capacity").ok()?;
        return raw.trim().parse().ok();
    }
    None
}

/// CPU utilization from consecutive `/proc/stat` deltas.
#[derive(Debug, Default)]
struct CpuTracker {
    last_total: u64,
    last_idle: u64,
}

impl CpuTracker {
    fn sample(&mut self) -> Option<f32> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();

        let total_delta = total.saturating_sub(self.last_total);
        let idle_delta = idle.saturating_sub(self.last_idle);
        let first_sample = self.last_total == 0;
        self.last_total = total;
        self.last_idle = idle;

        if first_sample || total_delta == 0 {
            return None;
        }
        Some(100.0 * (1.0 - idle_delta as f32 / total_delta as f32))
    }
}

fn run_cmd(args: &[&str]) -> Option<String> {
    let (program, rest) = args.split_first()?;
    let out = Command::new(program).args(rest).output().ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(memory_mb: f64, cpu: Option<f32>, battery: Option<f32>) -> ResourceUsage {
        ResourceUsage {
            process_memory_mb: memory_mb,
            available_memory_mb: None,
            cpu_percent: cpu,
            gpu_memory_mb: None,
            battery_percent: battery,
            sample_time: Utc::now(),
        }
    }

    #[test]
    fn detects_memory_violation() {
        let constraints = ResourceConstraints {
            max_memory_mb: 1_000,
            ..ResourceConstraints::default()
        };
        let violations = check_constraints(&usage(1_500.0, None, None), &constraints);
        assert!(matches!(
            violations.as_slice(),
            [ConstraintViolation::MemoryExceeded { .. }]
        ));
    }

    #[test]
    fn within_limits_is_clean() {
        let constraints = ResourceConstraints::default();
        assert!(check_constraints(&usage(100.0, Some(20.0), Some(90.0)), &constraints).is_empty());
    }

    #[test]
    fn cpu_or_battery_pressure_disallows_parallel() {
        let constraints = ResourceConstraints::default();
        assert!(allows_parallel(&usage(100.0, Some(10.0), None), &constraints));
        assert!(!allows_parallel(
            &usage(100.0, Some(99.0), None),
            &constraints
        ));
        assert!(!allows_parallel(
            &usage(100.0, Some(10.0), Some(5.0)),
            &constraints
        ));
        // Memory pressure alone does not forbid parallel.
        let tight = ResourceConstraints {
            max_memory_mb: 50,
            ..ResourceConstraints::default()
        };
        assert!(allows_parallel(&usage(100.0, Some(10.0), None), &tight));
    }

    #[test]
    fn unknown_probes_do_not_violate() {
        let constraints = ResourceConstraints::default();
        assert!(check_constraints(&usage(0.0, None, None), &constraints).is_empty());
    }

    #[tokio::test]
    async fn monitor_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let monitor = ResourceMonitor::new(Duration::from_millis(10), cancel.clone());
        let reader = monitor.reader();
        let handle = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
        // At least one sample was taken.
        let _ = reader.current();
    }
}
