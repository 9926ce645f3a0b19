//! In-process governance metrics.
//!
//! Atomic counters shared by the quota tracker and every tenant pipeline.
//! Totals are process-wide; per-tenant detail lives in the tracing spans.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::Error;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets in milliseconds, wide enough to cover backoff and quota waits.
    pub fn default_latency() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 15000.0, 30000.0, 60000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Sum in the observed unit; stored internally scaled by 1000.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Governance metrics registry.
#[derive(Debug)]
pub struct MetricsRegistry {
    pub calls_total: Counter,
    pub calls_success: Counter,
    pub upstream_unavailable: Counter,
    pub upstream_rejected: Counter,
    pub rate_limited: Counter,
    pub circuit_rejections: Counter,
    pub bulkhead_rejections: Counter,
    pub cancelled: Counter,
    pub retries: Counter,
    pub attempt_timeouts: Counter,
    pub quota_anomalies: Counter,
    pub quota_waits: Counter,
    pub in_flight: Gauge,
    pub call_latency_ms: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            calls_total: Counter::new(),
            calls_success: Counter::new(),
            upstream_unavailable: Counter::new(),
            upstream_rejected: Counter::new(),
            rate_limited: Counter::new(),
            circuit_rejections: Counter::new(),
            bulkhead_rejections: Counter::new(),
            cancelled: Counter::new(),
            retries: Counter::new(),
            attempt_timeouts: Counter::new(),
            quota_anomalies: Counter::new(),
            quota_waits: Counter::new(),
            in_flight: Gauge::new(),
            call_latency_ms: Histogram::default_latency(),
        }
    }

    /// Counts a new call and holds it in `in_flight` until the returned
    /// guard drops, so an abandoned call future still leaves the gauge.
    pub fn record_call_start(&self) -> InFlightCall<'_> {
        self.calls_total.inc();
        self.in_flight.inc();
        InFlightCall {
            gauge: &self.in_flight,
        }
    }

    /// Records the outcome and latency of a finished call.
    pub fn record_call_end(&self, error: Option<&Error>, latency_ms: f64) {
        self.call_latency_ms.observe(latency_ms);

        let Some(error) = error else {
            self.calls_success.inc();
            return;
        };
        match error {
            Error::UpstreamUnavailable { .. } => self.upstream_unavailable.inc(),
            Error::UpstreamRejected { .. } => self.upstream_rejected.inc(),
            Error::RateLimitExceeded { .. } => self.rate_limited.inc(),
            Error::CircuitOpen { .. } => self.circuit_rejections.inc(),
            Error::BulkheadRejected { .. } => self.bulkhead_rejections.inc(),
            Error::Cancelled { .. } => self.cancelled.inc(),
            Error::Config(_) => {}
        }
    }

    pub fn record_retry(&self) {
        self.retries.inc();
    }

    pub fn record_attempt_timeout(&self) {
        self.attempt_timeouts.inc();
    }

    pub fn record_quota_anomaly(&self) {
        self.quota_anomalies.inc();
    }

    pub fn record_quota_wait(&self) {
        self.quota_waits.inc();
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One call counted in [`MetricsRegistry::in_flight`].
#[derive(Debug)]
#[must_use = "the call leaves `in_flight` as soon as the guard drops"]
pub struct InFlightCall<'a> {
    gauge: &'a Gauge,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Point-in-time snapshot of [`MetricsRegistry`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSummary {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub upstream_unavailable: u64,
    pub upstream_rejected: u64,
    pub rate_limited: u64,
    pub circuit_rejections: u64,
    pub bulkhead_rejections: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub attempt_timeouts: u64,
    pub quota_anomalies: u64,
    pub quota_waits: u64,
    pub in_flight: i64,
    pub avg_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let count = registry.call_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.call_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            total_calls: registry.calls_total.get(),
            successful_calls: registry.calls_success.get(),
            upstream_unavailable: registry.upstream_unavailable.get(),
            upstream_rejected: registry.upstream_rejected.get(),
            rate_limited: registry.rate_limited.get(),
            circuit_rejections: registry.circuit_rejections.get(),
            bulkhead_rejections: registry.bulkhead_rejections.get(),
            cancelled: registry.cancelled.get(),
            retries: registry.retries.get(),
            attempt_timeouts: registry.attempt_timeouts.get(),
            quota_anomalies: registry.quota_anomalies.get(),
            quota_waits: registry.quota_waits.get(),
            in_flight: registry.in_flight.get(),
            avg_latency_ms: avg_latency,
        }
    }

    pub fn failed_calls(&self) -> u64 {
        self.upstream_unavailable
            + self.upstream_rejected
            + self.rate_limited
            + self.circuit_rejections
            + self.bulkhead_rejections
            + self.cancelled
    }
}
