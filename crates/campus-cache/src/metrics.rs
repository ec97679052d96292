//! Cache metrics.
//!
//! Two layers:
//! - [`OperationMetrics`]: in-process atomic counters backing the statistics report
//! - Prometheus series recorded through the `metrics` facade, rendered by
//!   [`render_metrics`] once [`init_metrics`] has installed the recorder

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cluster::ClusterState;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Weight of the newest sample in the rolling response-time average.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
    pub const CACHE_CLUSTER_STATE: &str = "cache_cluster_state";
}

/// Cache tier label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Distributed,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Distributed => "distributed",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Prometheus series
// =============================================================================

pub fn record_cache_hit(tier: Tier) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
}

pub fn record_cache_miss(tier: Tier) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier.as_str()).increment(1);
}

pub fn record_cache_error(tier: Tier, operation: &'static str) {
    counter!(
        names::CACHE_ERRORS_TOTAL,
        "tier" => tier.as_str(),
        "operation" => operation
    )
    .increment(1);
}

pub fn record_operation_duration(tier: Tier, duration: Duration) {
    histogram!(names::CACHE_OPERATION_DURATION_SECONDS, "tier" => tier.as_str())
        .record(duration.as_secs_f64());
}

/// Set the number of entries held by a tier.
pub fn set_cache_entries(tier: Tier, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier.as_str()).set(count as f64);
}

/// Record local-tier removals that were not requested by a caller.
pub fn record_evictions(reason: &'static str, count: u64) {
    if count > 0 {
        counter!(names::CACHE_EVICTIONS_TOTAL, "reason" => reason).increment(count);
    }
}

pub fn set_cluster_state(cluster_id: &str, state: ClusterState) {
    gauge!(names::CACHE_CLUSTER_STATE, "cluster" => cluster_id.to_string())
        .set(state.gauge_value());
}

// =============================================================================
// Operation counters
// =============================================================================

/// Append-only counters for one tier (or one cluster).
///
/// All updates are lock-free; the rolling average is an exponential moving
/// average stored as `f64` bits.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    samples: AtomicU64,
    avg_response_ms_bits: AtomicU64,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one response time into the rolling average.
    pub fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let first = self.samples.fetch_add(1, Ordering::Relaxed) == 0;
        // fetch_update only fails when the closure returns None
        let _ = self
            .avg_response_ms_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if first {
                    sample
                } else {
                    current + LATENCY_EMA_ALPHA * (sample - current)
                };
                Some(next.to_bits())
            });
    }

    pub fn snapshot(&self) -> OperationMetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        OperationMetricsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, hits + misses),
            avg_response_time_ms: f64::from_bits(self.avg_response_ms_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`OperationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub avg_response_time_ms: f64,
}

/// Hit rate in `[0, 1]`; zero when there were no requests.
pub fn hit_rate(hits: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        hits as f64 / requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_hit_rate() {
        let metrics = OperationMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_set();
        metrics.record_delete();
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.sets, 1);
        assert_eq!(snap.deletes, 1);
        assert_eq!(snap.errors, 1);
        assert!((snap.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rolling_latency() {
        let metrics = OperationMetrics::new();
        metrics.record_latency(Duration::from_millis(10));
        assert!((metrics.snapshot().avg_response_time_ms - 10.0).abs() < 1e-9);

        metrics.record_latency(Duration::from_millis(20));
        // 10 + 0.2 * (20 - 10)
        assert!((metrics.snapshot().avg_response_time_ms - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate_without_requests() {
        assert_eq!(hit_rate(0, 0), 0.0);
        assert_eq!(OperationMetrics::new().snapshot().hit_rate, 0.0);
    }
}
