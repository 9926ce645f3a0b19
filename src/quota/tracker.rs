//! Per-tenant quota bookkeeping.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::QuotaConfig;
use super::source::{AuthoritativeQuota, QuotaSource};
use super::status::{QuotaWindow, TenantQuotaStatus};
use crate::clock::{Clock, SystemClock, saturating_add, to_delta};
use crate::observability::MetricsRegistry;
use crate::{Error, Result, Stage};

/// Tracks remaining upstream quota for every tenant seen by this process.
///
/// Entries are created on first access and never removed. Counter updates
/// for one tenant are serialized by that tenant's own lock; different
/// tenants never contend.
pub struct QuotaTracker {
    config: QuotaConfig,
    windows: DashMap<String, Arc<Mutex<QuotaWindow>>>,
    clock: Arc<dyn Clock>,
    source: Option<Arc<dyn QuotaSource>>,
    metrics: Arc<MetricsRegistry>,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            clock: Arc::new(SystemClock),
            source: None,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn QuotaSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn window_delta(&self) -> TimeDelta {
        to_delta(self.config.window)
    }

    fn window(&self, tenant_id: &str) -> Arc<Mutex<QuotaWindow>> {
        if let Some(window) = self.windows.get(tenant_id) {
            return Arc::clone(window.value());
        }

        let reset_time = saturating_add(self.clock.now(), self.window_delta());
        let limit = self.config.limit;
        let entry = self
            .windows
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(QuotaWindow::new(limit, reset_time))));
        Arc::clone(entry.value())
    }

    /// Runs `f` under the tenant's lock after applying any due window reset.
    fn with_window<R>(
        &self,
        tenant_id: &str,
        f: impl FnOnce(&mut QuotaWindow) -> R,
    ) -> R {
        let window = self.window(tenant_id);
        let mut guard = window.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        if guard.roll(now, self.config.limit, self.window_delta()) {
            tracing::debug!(
                tenant = tenant_id,
                reset_time = %guard.reset_time,
                "Quota window reset"
            );
        }
        f(&mut guard)
    }

    fn status(&self, tenant_id: &str, window: &QuotaWindow) -> TenantQuotaStatus {
        TenantQuotaStatus {
            tenant_id: tenant_id.to_string(),
            limit: self.config.limit,
            remaining: window.remaining,
            reset_time: window.reset_time,
            warning_threshold: self.config.warning_threshold,
        }
    }

    pub fn check_status(&self, tenant_id: &str) -> TenantQuotaStatus {
        self.with_window(tenant_id, |window| self.status(tenant_id, window))
    }

    /// Consumes one unit of quota. At zero the call is recorded as an anomaly
    /// (it should have been held back by `wait_for_capacity`) and the counter
    /// stays at zero.
    pub fn record_usage(&self, tenant_id: &str) -> TenantQuotaStatus {
        self.with_window(tenant_id, |window| {
            if window.remaining > 0 {
                window.remaining -= 1;
            } else {
                self.metrics.record_quota_anomaly();
                tracing::warn!(
                    tenant = tenant_id,
                    reset_time = %window.reset_time,
                    "Call recorded with no quota remaining; it should have waited for capacity"
                );
            }
            self.status(tenant_id, window)
        })
    }

    /// Overwrites local counters with values the upstream reported.
    pub fn update_from_authoritative(
        &self,
        tenant_id: &str,
        remaining: u32,
        reset_time: DateTime<Utc>,
    ) -> TenantQuotaStatus {
        self.with_window(tenant_id, |window| {
            let limit = self.config.limit;
            if remaining > limit {
                tracing::debug!(
                    tenant = tenant_id,
                    remaining,
                    limit,
                    "Upstream reported more quota than configured; clamping"
                );
            }
            if window.remaining != remaining.min(limit) {
                tracing::debug!(
                    tenant = tenant_id,
                    local = window.remaining,
                    upstream = remaining,
                    "Reconciled quota drift"
                );
            }
            window.remaining = remaining.min(limit);
            window.reset_time = reset_time;
            self.status(tenant_id, window)
        })
    }

    pub fn update(&self, tenant_id: &str, quota: AuthoritativeQuota) -> TenantQuotaStatus {
        self.update_from_authoritative(tenant_id, quota.remaining, quota.reset_time)
    }

    pub fn reset_time(&self, tenant_id: &str) -> DateTime<Utc> {
        self.with_window(tenant_id, |window| window.reset_time)
    }

    /// Asks the registered [`QuotaSource`] for fresh numbers. Failures keep the
    /// cached state.
    pub async fn refresh(&self, tenant_id: &str) -> Option<TenantQuotaStatus> {
        let source = self.source.as_ref()?;
        match source.fetch(tenant_id).await {
            Ok(quota) => Some(self.update(tenant_id, quota)),
            Err(e) => {
                tracing::warn!(
                    tenant = tenant_id,
                    error = %e,
                    "Quota refresh failed; using cached state"
                );
                None
            }
        }
    }

    pub async fn wait_for_capacity(
        &self,
        tenant_id: &str,
        force_refresh: bool,
    ) -> Result<TenantQuotaStatus> {
        self.wait_for_capacity_with_cancel(tenant_id, force_refresh, &CancellationToken::new())
            .await
    }

    /// Suspends while the tenant's quota is exhausted, until the window resets
    /// (plus the configured buffer). Returns immediately when quota remains,
    /// warning if it is running low.
    pub async fn wait_for_capacity_with_cancel(
        &self,
        tenant_id: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<TenantQuotaStatus> {
        if force_refresh {
            self.refresh(tenant_id).await;
        }

        loop {
            let status = self.check_status(tenant_id);
            if !status.is_exceeded() {
                if status.is_approaching_limit() {
                    tracing::warn!(
                        tenant = tenant_id,
                        remaining = status.remaining,
                        limit = status.limit,
                        usage_pct = status.usage_percentage(),
                        "Quota approaching limit"
                    );
                }
                return Ok(status);
            }

            let wait = status
                .time_until_reset(self.clock.now())
                .saturating_add(self.config.reset_buffer);
            self.metrics.record_quota_wait();
            tracing::info!(
                tenant = tenant_id,
                reset_time = %status.reset_time,
                wait_secs = wait.as_secs_f64(),
                "Quota exhausted; waiting for reset"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        tenant: tenant_id.to_string(),
                        stage: Stage::Quota,
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.windows.iter().map(|e| e.key().clone()).collect()
    }

    pub fn summary(&self) -> Vec<TenantQuotaStatus> {
        self.tenant_ids()
            .iter()
            .map(|tenant_id| self.check_status(tenant_id))
            .collect()
    }
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("config", &self.config)
            .field("tenants", &self.windows.len())
            .field("clock", &self.clock)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::UpstreamError;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn tracker(limit: u32) -> (QuotaTracker, ManualClock) {
        let clock = ManualClock::default();
        let config = QuotaConfig {
            limit,
            ..Default::default()
        };
        let tracker = QuotaTracker::new(config).with_clock(Arc::new(clock.clone()));
        (tracker, clock)
    }

    #[test]
    fn test_unseen_tenant_has_full_quota() {
        let (tracker, clock) = tracker(5000);
        let status = tracker.check_status("new-tenant");
        assert_eq!(status.remaining, 5000);
        assert!(!status.is_exceeded());
        assert_eq!(status.reset_time, clock.now() + TimeDelta::hours(1));
    }

    #[test]
    fn test_record_usage_decrements() {
        let (tracker, _) = tracker(5000);
        for _ in 0..42 {
            tracker.record_usage("acme");
        }
        assert_eq!(tracker.check_status("acme").remaining, 4958);
    }

    #[test]
    fn test_record_usage_never_goes_negative() {
        let (tracker, _) = tracker(3);
        for _ in 0..5 {
            tracker.record_usage("acme");
        }
        assert_eq!(tracker.check_status("acme").remaining, 0);
        assert_eq!(tracker.metrics().summary().quota_anomalies, 2);
    }

    #[test]
    fn test_approaching_limit() {
        let (tracker, _) = tracker(5000);
        for _ in 0..4901 {
            tracker.record_usage("acme");
        }
        let status = tracker.check_status("acme");
        assert_eq!(status.remaining, 99);
        assert!(status.is_approaching_limit());
        assert!(!status.is_exceeded());
    }

    #[test]
    fn test_window_resets_after_reset_time() {
        let (tracker, clock) = tracker(10);
        let first_reset = tracker.reset_time("acme");
        for _ in 0..10 {
            tracker.record_usage("acme");
        }
        assert!(tracker.check_status("acme").is_exceeded());

        clock.set(first_reset);
        let status = tracker.check_status("acme");
        assert_eq!(status.remaining, 10);
        assert_eq!(status.reset_time, first_reset + TimeDelta::hours(1));
    }

    #[test]
    fn test_oversized_window_saturates_reset_time() {
        let clock = ManualClock::default();
        let config = QuotaConfig {
            window: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let tracker = QuotaTracker::new(config).with_clock(Arc::new(clock.clone()));

        let status = tracker.record_usage("acme");
        assert_eq!(status.reset_time, DateTime::<Utc>::MAX_UTC);
        assert_eq!(status.remaining, status.limit - 1);

        clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert_eq!(tracker.check_status("acme").remaining, status.limit - 1);
    }

    #[test]
    fn test_authoritative_update_overwrites() {
        let (tracker, clock) = tracker(5000);
        tracker.record_usage("acme");

        let reset = clock.now() + TimeDelta::minutes(10);
        let status = tracker.update_from_authoritative("acme", 1234, reset);
        assert_eq!(status.remaining, 1234);
        assert_eq!(tracker.reset_time("acme"), reset);

        let status = tracker.update_from_authoritative("acme", 9999, reset);
        assert_eq!(status.remaining, 5000);
    }

    #[test]
    fn test_tenants_are_independent() {
        let (tracker, _) = tracker(100);
        tracker.record_usage("a");
        tracker.record_usage("a");
        tracker.record_usage("b");
        assert_eq!(tracker.check_status("a").remaining, 98);
        assert_eq!(tracker.check_status("b").remaining, 99);

        let mut ids = tracker.tenant_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.summary().len(), 2);
    }

    #[test]
    fn test_concurrent_record_usage() {
        use std::thread;

        let (tracker, _) = tracker(5000);
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let t = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..100 {
                        t.record_usage("tenant-concurrent");
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tracker.check_status("tenant-concurrent").remaining, 4000);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_with_capacity() {
        let (tracker, _) = tracker(5000);
        let status = tracker.wait_for_capacity("acme", false).await.unwrap();
        assert_eq!(status.remaining, 5000);
        assert_eq!(tracker.metrics().summary().quota_waits, 0);
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let (tracker, clock) = tracker(5000);
        tracker.update_from_authoritative("acme", 0, clock.now() + TimeDelta::hours(1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tracker
            .wait_for_capacity_with_cancel("acme", false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Cancelled {
                stage: Stage::Quota,
                ..
            }
        ));
    }

    struct FixedSource(AuthoritativeQuota);

    #[async_trait::async_trait]
    impl QuotaSource for FixedSource {
        async fn fetch(
            &self,
            _tenant_id: &str,
        ) -> std::result::Result<AuthoritativeQuota, UpstreamError> {
            Ok(self.0)
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl QuotaSource for FailingSource {
        async fn fetch(
            &self,
            _tenant_id: &str,
        ) -> std::result::Result<AuthoritativeQuota, UpstreamError> {
            Err(UpstreamError::network("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_force_refresh_uses_source() {
        let (tracker, clock) = tracker(5000);
        let reset = clock.now() + TimeDelta::minutes(30);
        let tracker =
            tracker.with_source(Arc::new(FixedSource(AuthoritativeQuota::new(42, reset))));

        let status = tracker.wait_for_capacity("acme", true).await.unwrap();
        assert_eq!(status.remaining, 42);
        assert_eq!(status.reset_time, reset);

        // Without force_refresh the cached value is used as-is.
        tracker.record_usage("acme");
        let status = tracker.wait_for_capacity("acme", false).await.unwrap();
        assert_eq!(status.remaining, 41);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_cached_state() {
        let (tracker, _) = tracker(5000);
        let tracker = tracker.with_source(Arc::new(FailingSource));
        tracker.record_usage("acme");

        assert!(tracker.refresh("acme").await.is_none());
        assert_eq!(tracker.check_status("acme").remaining, 4999);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_rechecks_after_sleep() {
        let (tracker, clock) = tracker(10);
        let tracker = Arc::new(tracker);
        tracker.update_from_authoritative("acme", 0, clock.now() + TimeDelta::seconds(5));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_capacity("acme", false).await })
        };

        // First sleep is reset (5s) plus the 1s buffer; move the manual clock
        // past the boundary before that sleep ends.
        tokio::time::sleep(Duration::from_secs(3)).await;
        clock.advance(Duration::from_secs(6));

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status.remaining, 10);
        assert_eq!(tracker.metrics().summary().quota_waits, 1);
    }
}
