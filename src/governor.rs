//! Facade over the quota tracker and the per-tenant pipelines.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::classify::UpstreamError;
use crate::clock::Clock;
use crate::config::GovernorConfig;
use crate::observability::{CallSpan, MetricsRegistry};
use crate::quota::{QuotaSource, QuotaTracker, TenantQuotaStatus};
use crate::resilience::{CircuitSnapshot, PipelineRegistry, TenantCircuitState};
use crate::{Error, Result};

/// Entry point for governed upstream calls.
///
/// One instance serves every tenant. Quota and breaker state for a tenant is
/// created on first use and lives as long as the governor.
#[derive(Debug)]
pub struct Governor {
    config: GovernorConfig,
    quota: QuotaTracker,
    pipelines: PipelineRegistry,
    metrics: Arc<MetricsRegistry>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        GovernorBuilder::new().config(config).build()
    }

    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::new()
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    // ---- quota -------------------------------------------------------------

    pub fn check_status(&self, tenant_id: &str) -> TenantQuotaStatus {
        self.quota.check_status(tenant_id)
    }

    pub fn record_usage(&self, tenant_id: &str) -> TenantQuotaStatus {
        self.quota.record_usage(tenant_id)
    }

    pub fn update_from_authoritative(
        &self,
        tenant_id: &str,
        remaining: u32,
        reset_time: DateTime<Utc>,
    ) -> TenantQuotaStatus {
        self.quota
            .update_from_authoritative(tenant_id, remaining, reset_time)
    }

    pub fn reset_time(&self, tenant_id: &str) -> DateTime<Utc> {
        self.quota.reset_time(tenant_id)
    }

    pub async fn wait_for_capacity(
        &self,
        tenant_id: &str,
        force_refresh: bool,
    ) -> Result<TenantQuotaStatus> {
        self.quota.wait_for_capacity(tenant_id, force_refresh).await
    }

    pub async fn wait_for_capacity_with_cancel(
        &self,
        tenant_id: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<TenantQuotaStatus> {
        self.quota
            .wait_for_capacity_with_cancel(tenant_id, force_refresh, cancel)
            .await
    }

    pub fn quota_summary(&self) -> Vec<TenantQuotaStatus> {
        self.quota.summary()
    }

    // ---- resilience --------------------------------------------------------

    /// Runs `operation` through the tenant's full pipeline. Quota is neither
    /// awaited nor consumed here; see [`Governor::call`].
    pub async fn execute<T, F, Fut>(&self, tenant_id: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        self.execute_with_cancel(tenant_id, &CancellationToken::new(), operation)
            .await
    }

    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let call = CallSpan::new(tenant_id, "execute");
        let span = call.span().clone();
        let _in_flight = self.metrics.record_call_start();

        let pipeline = self.pipelines.get_or_create(tenant_id);
        let result = pipeline.execute(cancel, operation).instrument(span).await;
        self.finish(tenant_id, call, result)
    }

    /// Retry and timeout only. The tenant's breaker is neither consulted nor
    /// updated.
    pub async fn execute_with_retry_only<T, F, Fut>(
        &self,
        tenant_id: &str,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        self.execute_with_retry_only_with_cancel(tenant_id, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`execute_with_retry_only`](Self::execute_with_retry_only), but
    /// gives up at the next attempt or backoff once `cancel` fires.
    pub async fn execute_with_retry_only_with_cancel<T, F, Fut>(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let call = CallSpan::new(tenant_id, "execute_with_retry_only");
        let span = call.span().clone();
        let _in_flight = self.metrics.record_call_start();

        let result = self
            .pipelines
            .execute_with_retry_only(tenant_id, cancel, operation)
            .instrument(span)
            .await;
        self.finish(tenant_id, call, result)
    }

    /// Waits for quota, consumes one unit, then executes.
    pub async fn call<T, F, Fut>(&self, tenant_id: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        self.call_with_cancel(tenant_id, &CancellationToken::new(), operation)
            .await
    }

    pub async fn call_with_cancel<T, F, Fut>(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        self.quota
            .wait_for_capacity_with_cancel(tenant_id, false, cancel)
            .await?;
        self.quota.record_usage(tenant_id);
        self.execute_with_cancel(tenant_id, cancel, operation).await
    }

    fn finish<T>(&self, tenant_id: &str, call: CallSpan, result: Result<T>) -> Result<T> {
        let error = result.as_ref().err();
        let outcome = error.map(Error::label).unwrap_or("success");
        let latency_ms = call.finish(outcome);
        self.metrics.record_call_end(error, latency_ms);

        if let Some(Error::RateLimitExceeded {
            reset_at: Some(reset_at),
            ..
        }) = error
        {
            self.quota.update_from_authoritative(tenant_id, 0, *reset_at);
        }
        if let Some(error) = error {
            tracing::debug!(tenant = tenant_id, outcome, error = %error, "Governed call failed");
        }
        result
    }

    pub fn circuit_state(&self, tenant_id: &str) -> TenantCircuitState {
        self.pipelines.circuit_state(tenant_id)
    }

    /// Forces the tenant's breaker closed. Returns false if it has none yet.
    pub fn reset_circuit(&self, tenant_id: &str) -> bool {
        self.pipelines.reset_circuit(tenant_id)
    }

    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.pipelines.circuit_snapshot()
    }
}

/// Builder for [`Governor`] with an injectable clock and quota source.
#[derive(Default)]
pub struct GovernorBuilder {
    config: GovernorConfig,
    clock: Option<Arc<dyn Clock>>,
    quota_source: Option<Arc<dyn QuotaSource>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl GovernorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn quota_source(mut self, source: Arc<dyn QuotaSource>) -> Self {
        self.quota_source = Some(source);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Governor {
        let metrics = self.metrics.unwrap_or_default();

        let mut quota =
            QuotaTracker::new(self.config.quota.clone()).with_metrics(Arc::clone(&metrics));
        if let Some(clock) = self.clock {
            quota = quota.with_clock(clock);
        }
        if let Some(source) = self.quota_source {
            quota = quota.with_source(source);
        }

        let pipelines =
            PipelineRegistry::new(self.config.resilience.clone(), Arc::clone(&metrics));

        Governor {
            config: self.config,
            quota,
            pipelines,
            metrics,
        }
    }
}

impl std::fmt::Debug for GovernorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernorBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("quota_source", &self.quota_source.is_some())
            .finish_non_exhaustive()
    }
}
