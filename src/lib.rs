//! # tenant-governor
//!
//! Per-tenant call governance for a rate-limited upstream HTTP API.
//!
//! Every tenant gets its own quota window and its own resilience pipeline
//! (bulkhead, circuit breaker, retry, per-attempt timeout). Failures are
//! classified so that quota exhaustion never trips a breaker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tenant_governor::{Governor, GovernorConfig, UpstreamError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tenant_governor::Error> {
//!     let governor = Governor::new(GovernorConfig::default());
//!
//!     governor.wait_for_capacity("acme", false).await?;
//!     governor.record_usage("acme");
//!     let body = governor
//!         .execute("acme", || async {
//!             // issue the real HTTP call here
//!             Ok::<_, UpstreamError>("payload".to_string())
//!         })
//!         .await?;
//!
//!     println!("{}", body);
//!     Ok(())
//! }
//! ```
//!
//! ## Loading configuration
//!
//! ```rust,no_run
//! use tenant_governor::config::ConfigBuilder;
//! use tenant_governor::{Governor, GovernorConfig};
//!
//! # async fn example() -> Result<(), tenant_governor::Error> {
//! let provider = ConfigBuilder::new()
//!     .env_with_prefix("GOVERNOR_")
//!     .file("governor.json")
//!     .build()
//!     .await?;
//! let governor = Governor::new(GovernorConfig::from_provider(&provider).await?);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod classify;
pub mod clock;
pub mod config;
pub mod governor;
pub mod observability;
pub mod prelude;
pub mod quota;
pub mod resilience;

pub use classify::{FailureClass, UpstreamError, classify};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GovernorConfig};
pub use governor::{Governor, GovernorBuilder};
pub use observability::{MetricsRegistry, MetricsSummary};
pub use quota::{AuthoritativeQuota, QuotaConfig, QuotaSource, QuotaTracker, TenantQuotaStatus};
pub use resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerRegistry, CircuitConfig,
    CircuitSnapshot, CircuitState, ExponentialBackoff, PipelineRegistry, ResilienceConfig,
    RetryConfig, TenantCircuitState, TenantPipeline,
};

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Pipeline stage at which a governance error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Waiting for quota capacity.
    Quota,
    /// Concurrency limiting.
    Bulkhead,
    /// Breaker admission.
    CircuitBreaker,
    /// Backoff between attempts, or retries exhausted.
    Retry,
    /// Per-attempt timeout expired.
    Timeout,
    /// The wrapped operation itself.
    Operation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Quota => "quota",
            Stage::Bulkhead => "bulkhead",
            Stage::CircuitBreaker => "circuit_breaker",
            Stage::Retry => "retry",
            Stage::Timeout => "timeout",
            Stage::Operation => "operation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for governed calls.
///
/// Every governance variant carries the tenant and the stage it came from,
/// so operators can tell upstream outages from deliberate back-off and from
/// local saturation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Transient failure that persisted through every retry.
    #[error("Upstream unavailable for tenant '{tenant}' after {attempts} attempt(s) ({stage}): {source}")]
    UpstreamUnavailable {
        tenant: String,
        stage: Stage,
        attempts: u32,
        source: UpstreamError,
    },

    /// Permanent failure, surfaced on first occurrence.
    #[error("Upstream rejected request for tenant '{tenant}': {source}")]
    UpstreamRejected {
        tenant: String,
        stage: Stage,
        source: UpstreamError,
    },

    /// Upstream quota signal. Never retried, never counted by the breaker.
    #[error("Rate limit exceeded for tenant '{tenant}'{}", reset_suffix(.reset_at))]
    RateLimitExceeded {
        tenant: String,
        stage: Stage,
        reset_at: Option<DateTime<Utc>>,
    },

    /// The tenant's breaker is open; the operation was not invoked.
    #[error("Circuit open for tenant '{tenant}', retry in {:.1}s", .retry_in.as_secs_f64())]
    CircuitOpen { tenant: String, retry_in: Duration },

    /// The tenant already has the maximum concurrent and queued calls.
    #[error("Bulkhead full for tenant '{tenant}' ({max_concurrent} in flight, {max_queued} queued)")]
    BulkheadRejected {
        tenant: String,
        max_concurrent: usize,
        max_queued: usize,
    },

    /// The caller abandoned the call.
    #[error("Call for tenant '{tenant}' cancelled during {stage}")]
    Cancelled { tenant: String, stage: Stage },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn tenant(&self) -> Option<&str> {
        match self {
            Error::UpstreamUnavailable { tenant, .. }
            | Error::UpstreamRejected { tenant, .. }
            | Error::RateLimitExceeded { tenant, .. }
            | Error::CircuitOpen { tenant, .. }
            | Error::BulkheadRejected { tenant, .. }
            | Error::Cancelled { tenant, .. } => Some(tenant),
            Error::Config(_) => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::UpstreamUnavailable { stage, .. }
            | Error::UpstreamRejected { stage, .. }
            | Error::RateLimitExceeded { stage, .. }
            | Error::Cancelled { stage, .. } => Some(*stage),
            Error::CircuitOpen { .. } => Some(Stage::CircuitBreaker),
            Error::BulkheadRejected { .. } => Some(Stage::Bulkhead),
            Error::Config(_) => None,
        }
    }

    /// Classification of the upstream failure behind this error, if any.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Error::UpstreamUnavailable { .. } => Some(FailureClass::Transient),
            Error::UpstreamRejected { .. } => Some(FailureClass::Permanent),
            Error::RateLimitExceeded { .. } => Some(FailureClass::RateLimited),
            _ => None,
        }
    }

    /// True when the call was refused locally without invoking the operation.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. } | Error::BulkheadRejected { .. }
        )
    }

    /// Stable label for metrics and span fields.
    pub fn label(&self) -> &'static str {
        match self {
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::UpstreamRejected { .. } => "upstream_rejected",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::BulkheadRejected { .. } => "bulkhead_rejected",
            Error::Cancelled { .. } => "cancelled",
            Error::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn reset_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(at) => format!(", resets at {}", at.to_rfc3339()),
        None => String::new(),
    }
}
