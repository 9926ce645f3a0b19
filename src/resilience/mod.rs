//! Resilience pipelines for upstream calls.
//!
//! Each tenant gets a bulkhead, a circuit breaker, retry with exponential
//! backoff and a per-attempt timeout, composed in that order.

mod backoff;
mod bulkhead;
mod circuit;
mod pipeline;

pub use backoff::ExponentialBackoff;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit};
pub use circuit::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitPermit, CircuitSnapshot,
    CircuitState, TenantCircuitState,
};
pub use pipeline::{PipelineRegistry, RetryStage, TenantPipeline};

use std::time::Duration;

/// Settings shared by every tenant pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub bulkhead: BulkheadConfig,
    /// Applies to each attempt, not to the call as a whole.
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff.delay_for(n)`.
    pub backoff: ExponentialBackoff,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            bulkhead: BulkheadConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl ResilienceConfig {
    /// Single attempt, breaker and bulkhead at defaults.
    pub fn no_retry() -> Self {
        Self {
            retry: RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }
}
