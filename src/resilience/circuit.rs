//! Per-tenant circuit breakers.
//!
//! The breaker trips on a failure ratio, not a consecutive count: it opens
//! once at least `min_throughput` calls were seen in the current sampling
//! window and the share of failures reaches `failure_ratio`. Only outcomes
//! the caller reports as failures are counted; the pipeline reports
//! transient failures only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

/// Stand-in for open durations too large for `Instant` arithmetic.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker state as seen from the registry, which may not have a breaker
/// for the tenant yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TenantCircuitState {
    Uninitialized,
    Closed,
    Open,
    HalfOpen,
}

impl From<CircuitState> for TenantCircuitState {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::Open => Self::Open,
            CircuitState::HalfOpen => Self::HalfOpen,
        }
    }
}

/// Breaker thresholds, applied per tenant.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitConfig {
    /// Minimum calls in the sampling window before the ratio is evaluated.
    pub min_throughput: u32,
    /// Failure share in `(0, 1]` at which the breaker opens.
    pub failure_ratio: f64,
    /// Counters restart once a window this long has elapsed.
    pub sampling_window: Duration,
    /// How long an open breaker fails fast before admitting a probe.
    pub open_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            min_throughput: 5,
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    window_start: Instant,
    successes: u32,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Inner {
    fn clear_counts(&mut self, now: Instant) {
        self.window_start = now;
        self.successes = 0;
        self.failures = 0;
    }
}

/// Point-in-time view of one breaker.
#[derive(Clone, Debug, Serialize)]
pub struct CircuitSnapshot {
    pub tenant_id: String,
    pub state: CircuitState,
    pub successes: u32,
    pub failures: u32,
    /// Time left before an open breaker admits a probe.
    pub open_remaining: Option<Duration>,
}

pub struct CircuitBreaker {
    tenant_id: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(tenant_id: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                window_start: Instant::now(),
                successes: 0,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Locks and applies time-driven transitions: an expired open period
    /// becomes half-open, an expired sampling window starts over.
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match inner.phase {
            Phase::Open { until } if now >= until => {
                inner.phase = Phase::HalfOpen {
                    probe_in_flight: false,
                };
                tracing::info!(tenant = %self.tenant_id, "Circuit breaker half-open");
            }
            Phase::Closed
                if now.duration_since(inner.window_start) >= self.config.sampling_window =>
            {
                inner.clear_counts(now);
            }
            _ => {}
        }
        inner
    }

    pub fn state(&self) -> CircuitState {
        match self.lock().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Admits a call, or returns how long until the breaker may admit one.
    /// While half-open only one probe is admitted at a time.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, Duration> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Closed => Ok(CircuitPermit::new(self, false)),
            Phase::Open { until } => Err(until.saturating_duration_since(Instant::now())),
            Phase::HalfOpen {
                probe_in_flight: true,
            } => Err(Duration::ZERO),
            Phase::HalfOpen {
                probe_in_flight: false,
            } => {
                inner.phase = Phase::HalfOpen {
                    probe_in_flight: true,
                };
                tracing::debug!(tenant = %self.tenant_id, "Circuit breaker admitting probe");
                Ok(CircuitPermit::new(self, true))
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Closed => inner.successes += 1,
            Phase::HalfOpen { .. } if probe => {
                inner.phase = Phase::Closed;
                inner.opened_at = None;
                inner.clear_counts(Instant::now());
                tracing::info!(tenant = %self.tenant_id, "Circuit breaker closed after probe");
            }
            // Outcome of a call admitted before the breaker opened.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Closed => {
                inner.failures += 1;
                let total = inner.successes + inner.failures;
                let ratio = inner.failures as f64 / total as f64;
                if total >= self.config.min_throughput && ratio >= self.config.failure_ratio {
                    tracing::warn!(
                        tenant = %self.tenant_id,
                        failures = inner.failures,
                        total,
                        open_secs = self.config.open_duration.as_secs_f64(),
                        "Circuit breaker opened"
                    );
                    self.open(&mut inner);
                }
            }
            Phase::HalfOpen { .. } if probe => {
                tracing::warn!(tenant = %self.tenant_id, "Circuit breaker probe failed; reopening");
                self.open(&mut inner);
            }
            _ => {}
        }
    }

    fn on_release(&self, probe: bool) {
        let mut inner = self.lock();
        if probe && matches!(inner.phase, Phase::HalfOpen { .. }) {
            inner.phase = Phase::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    fn open(&self, inner: &mut Inner) {
        let now = Instant::now();
        let until = now
            .checked_add(self.config.open_duration)
            .unwrap_or_else(|| now + FAR_FUTURE);
        inner.phase = Phase::Open { until };
        inner.opened_at = Some(now);
        inner.clear_counts(now);
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.phase = Phase::Closed;
        inner.opened_at = None;
        inner.clear_counts(Instant::now());
        tracing::info!(tenant = %self.tenant_id, "Circuit breaker reset");
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let (state, open_remaining) = match inner.phase {
            Phase::Closed => (CircuitState::Closed, None),
            Phase::Open { until } => (
                CircuitState::Open,
                Some(until.saturating_duration_since(Instant::now())),
            ),
            Phase::HalfOpen { .. } => (CircuitState::HalfOpen, None),
        };
        CircuitSnapshot {
            tenant_id: self.tenant_id.clone(),
            state,
            successes: inner.successes,
            failures: inner.failures,
            open_remaining,
        }
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.lock().opened_at
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Settle it with exactly one outcome. Dropping it unsettled (a cancelled
/// call) records nothing and frees a half-open probe slot.
#[must_use = "a permit must be settled with an outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Settles without counting the outcome either way.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.probe);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.probe);
        }
    }
}

/// One breaker per tenant, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, tenant_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(tenant_id) {
            return Arc::clone(breaker.value());
        }
        let entry = self
            .breakers
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(tenant_id, self.config.clone())));
        Arc::clone(entry.value())
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(tenant_id).map(|b| Arc::clone(b.value()))
    }

    pub fn state(&self, tenant_id: &str) -> TenantCircuitState {
        self.get(tenant_id)
            .map(|b| b.state().into())
            .unwrap_or(TenantCircuitState::Uninitialized)
    }

    /// Returns false when the tenant has no breaker yet.
    pub fn reset(&self, tenant_id: &str) -> bool {
        match self.get(tenant_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        breakers.iter().map(|b| b.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            min_throughput: 4,
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }

    fn fail(cb: &CircuitBreaker) {
        cb.try_acquire().unwrap().record_failure();
    }

    fn succeed(cb: &CircuitBreaker) {
        cb.try_acquire().unwrap().record_success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("t", CircuitConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_sample_does_not_trip() {
        let cb = CircuitBreaker::new("t", config());
        fail(&cb);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_rule() {
        let cb = CircuitBreaker::new("t", config());
        succeed(&cb);
        succeed(&cb);
        succeed(&cb);
        fail(&cb);
        // 1 of 4 failed
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        // 2 of 5
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        // 3 of 6
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_window_expires() {
        let cb = CircuitBreaker::new("t", config());
        fail(&cb);
        fail(&cb);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_until_duration_elapses() {
        let cb = CircuitBreaker::new("t", config());
        for _ in 0..4 {
            fail(&cb);
        }
        let retry_in = cb.try_acquire().err().unwrap();
        assert_eq!(retry_in, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe() {
        let cb = CircuitBreaker::new("t", config());
        for _ in 0..4 {
            fail(&cb);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(cb.try_acquire().is_err());

        probe.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_for_full_duration() {
        let cb = CircuitBreaker::new("t", config());
        for _ in 0..4 {
            fail(&cb);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            cb.snapshot().open_remaining,
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_open_duration_stays_open() {
        let cb = CircuitBreaker::new(
            "t",
            CircuitConfig {
                open_duration: Duration::MAX,
                ..config()
            },
        );
        for _ in 0..4 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let cb = CircuitBreaker::new("t", config());
        for _ in 0..4 {
            fail(&cb);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_outcome_not_counted() {
        let cb = CircuitBreaker::new("t", config());
        for _ in 0..10 {
            cb.try_acquire().unwrap().release();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = CircuitBreaker::new("t", config());
        for _ in 0..4 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.opened_at().is_some());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.opened_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_isolates_tenants() {
        let registry = CircuitBreakerRegistry::new(config());
        assert_eq!(registry.state("a"), TenantCircuitState::Uninitialized);
        assert!(!registry.reset("a"));

        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");
        for _ in 0..4 {
            fail(&a);
        }
        assert_eq!(registry.state("a"), TenantCircuitState::Open);
        assert_eq!(registry.state("b"), TenantCircuitState::Closed);
        assert!(b.try_acquire().is_ok());

        assert!(Arc::ptr_eq(&a, &registry.get_or_create("a")));
        assert!(registry.reset("a"));
        assert_eq!(registry.state("a"), TenantCircuitState::Closed);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
