//! Composed per-tenant pipelines.
//!
//! Stages, outermost first: bulkhead, circuit breaker, retry, per-attempt
//! timeout. [`RetryStage`] owns the two inner stages so the retry-only path
//! and the full pipeline share one implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::bulkhead::Bulkhead;
use super::circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitSnapshot, TenantCircuitState};
use super::{ResilienceConfig, RetryConfig};
use crate::classify::{FailureClass, UpstreamError};
use crate::observability::{MetricsRegistry, record_attempts};
use crate::{Error, Result, Stage};

/// Why the retry stage gave up.
#[derive(Debug)]
enum StageFailure {
    Upstream {
        error: UpstreamError,
        attempts: u32,
        stage: Stage,
    },
    Cancelled(Stage),
}

impl StageFailure {
    fn class(&self) -> Option<FailureClass> {
        match self {
            StageFailure::Upstream { error, .. } => Some(error.class()),
            StageFailure::Cancelled(_) => None,
        }
    }

    fn into_error(self, tenant_id: &str) -> Error {
        let tenant = tenant_id.to_string();
        match self {
            StageFailure::Cancelled(stage) => Error::Cancelled { tenant, stage },
            StageFailure::Upstream {
                error,
                attempts,
                stage,
            } => match error.class() {
                FailureClass::Transient => Error::UpstreamUnavailable {
                    tenant,
                    stage,
                    attempts,
                    source: error,
                },
                FailureClass::Permanent => Error::UpstreamRejected {
                    tenant,
                    stage,
                    source: error,
                },
                FailureClass::RateLimited => Error::RateLimitExceeded {
                    tenant,
                    stage,
                    reset_at: error.reset_at(),
                },
            },
        }
    }
}

/// Retry with exponential backoff around a per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RetryStage {
    retry: RetryConfig,
    timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl RetryStage {
    pub fn new(retry: RetryConfig, timeout: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            retry,
            timeout,
            metrics,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-transient class,
    /// or the retry budget is spent. Each attempt gets a fresh future; an
    /// attempt that outlives the timeout is dropped.
    async fn run<T, F, Fut>(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
        operation: &mut F,
    ) -> std::result::Result<T, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            record_attempts(attempt);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StageFailure::Cancelled(Stage::Operation)),
                outcome = tokio::time::timeout(self.timeout, operation()) => outcome,
            };

            let (error, stage) = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => (error, Stage::Operation),
                Err(_) => {
                    self.metrics.record_attempt_timeout();
                    (UpstreamError::Timeout(self.timeout), Stage::Timeout)
                }
            };

            let class = error.class();
            if !class.is_retryable() || attempt > self.retry.max_retries {
                let stage = match (class, stage) {
                    (FailureClass::Transient, Stage::Operation) if attempt > 1 => Stage::Retry,
                    _ => stage,
                };
                if class == FailureClass::RateLimited {
                    tracing::warn!(
                        tenant = tenant_id,
                        reset_at = ?error.reset_at(),
                        "Upstream rate limit signal"
                    );
                }
                return Err(StageFailure::Upstream {
                    error,
                    attempts: attempt,
                    stage,
                });
            }

            let delay = self.retry.backoff.delay_for(attempt);
            self.metrics.record_retry();
            tracing::warn!(
                tenant = tenant_id,
                attempt,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient upstream failure; retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StageFailure::Cancelled(Stage::Retry)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        self.run(tenant_id, cancel, &mut operation)
            .await
            .map_err(|failure| failure.into_error(tenant_id))
    }
}

/// The composed pipeline for one tenant.
#[derive(Debug)]
pub struct TenantPipeline {
    tenant_id: String,
    bulkhead: Bulkhead,
    breaker: Arc<CircuitBreaker>,
    retry: RetryStage,
    metrics: Arc<MetricsRegistry>,
}

impl TenantPipeline {
    pub fn new(
        tenant_id: impl Into<String>,
        config: &ResilienceConfig,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            bulkhead: Bulkhead::new(tenant_id.clone(), config.bulkhead.clone()),
            breaker,
            retry: RetryStage::new(config.retry.clone(), config.timeout, Arc::clone(&metrics)),
            metrics,
            tenant_id,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let _slot = self.bulkhead.acquire(cancel).await?;

        let permit = self.breaker.try_acquire().map_err(|retry_in| {
            tracing::debug!(
                tenant = %self.tenant_id,
                retry_in_ms = retry_in.as_millis() as u64,
                "Circuit open; failing fast"
            );
            Error::CircuitOpen {
                tenant: self.tenant_id.clone(),
                retry_in,
            }
        })?;

        match self.retry.run(&self.tenant_id, cancel, &mut operation).await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(failure) => {
                match failure.class() {
                    Some(FailureClass::Transient) => permit.record_failure(),
                    // The upstream answered; the request itself was bad.
                    Some(FailureClass::Permanent) => permit.record_success(),
                    Some(FailureClass::RateLimited) | None => permit.release(),
                }
                Err(failure.into_error(&self.tenant_id))
            }
        }
    }
}

/// Builds and caches one [`TenantPipeline`] per tenant.
#[derive(Debug)]
pub struct PipelineRegistry {
    config: ResilienceConfig,
    pipelines: DashMap<String, Arc<TenantPipeline>>,
    breakers: CircuitBreakerRegistry,
    retry_only: RetryStage,
    metrics: Arc<MetricsRegistry>,
}

impl PipelineRegistry {
    pub fn new(config: ResilienceConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(config.circuit.clone()),
            retry_only: RetryStage::new(
                config.retry.clone(),
                config.timeout,
                Arc::clone(&metrics),
            ),
            pipelines: DashMap::new(),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantPipeline>> {
        self.pipelines.get(tenant_id).map(|p| Arc::clone(p.value()))
    }

    pub fn get_or_create(&self, tenant_id: &str) -> Arc<TenantPipeline> {
        if let Some(pipeline) = self.pipelines.get(tenant_id) {
            return Arc::clone(pipeline.value());
        }
        let entry = self
            .pipelines
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(tenant = tenant_id, "Creating resilience pipeline");
                Arc::new(TenantPipeline::new(
                    tenant_id,
                    &self.config,
                    self.breakers.get_or_create(tenant_id),
                    Arc::clone(&self.metrics),
                ))
            });
        Arc::clone(entry.value())
    }

    /// Retry and timeout only; no bulkhead, no breaker, no pipeline created.
    pub async fn execute_with_retry_only<T, F, Fut>(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        self.retry_only.execute(tenant_id, cancel, operation).await
    }

    pub fn circuit_state(&self, tenant_id: &str) -> TenantCircuitState {
        self.breakers.state(tenant_id)
    }

    pub fn reset_circuit(&self, tenant_id: &str) -> bool {
        self.breakers.reset(tenant_id)
    }

    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshot()
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.pipelines.iter().map(|e| e.key().clone()).collect()
    }
}
