//! Failure classification for upstream calls.
//!
//! Collaborators map their transport failures into [`UpstreamError`]; the
//! pipeline only ever switches on [`FailureClass`].

use std::time::Duration;

use chrono::{DateTime, Utc};

/// How the pipeline treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// May succeed on retry (connectivity, timeouts, 5xx).
    Transient,
    /// Will not succeed on retry (malformed request, not found, forbidden).
    Permanent,
    /// The upstream quota is exhausted for this tenant.
    RateLimited,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }

    /// Whether the circuit breaker counts this class as a failure.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

/// Failure raised by a governed operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Connection, DNS or TLS failure before a response arrived.
    #[error("Network request failed: {0}")]
    Network(String),

    /// The attempt did not finish in time.
    #[error("Attempt timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The upstream answered with a non-success status.
    #[error("Upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The upstream signalled quota exhaustion.
    #[error("Upstream quota exhausted{}", until_suffix(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// The collaborator knows the request can never succeed.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl UpstreamError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn rate_limited(reset_at: Option<DateTime<Utc>>) -> Self {
        Self::RateLimited { reset_at }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn class(&self) -> FailureClass {
        classify(self)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Authoritative reset instant carried by a rate-limit signal.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { reset_at } => *reset_at,
            _ => None,
        }
    }
}

fn until_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
    reset_at
        .map(|at| format!(" until {}", at.to_rfc3339()))
        .unwrap_or_default()
}

/// Maps a failure to its class. Pure; never inspects message text.
pub fn classify(error: &UpstreamError) -> FailureClass {
    match error {
        UpstreamError::Network(_) | UpstreamError::Timeout(_) => FailureClass::Transient,
        UpstreamError::RateLimited { .. } => FailureClass::RateLimited,
        UpstreamError::Rejected(_) => FailureClass::Permanent,
        UpstreamError::Status { status, .. } => match status {
            429 => FailureClass::RateLimited,
            408 | 500..=599 => FailureClass::Transient,
            _ => FailureClass::Permanent,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures_are_transient() {
        assert_eq!(
            classify(&UpstreamError::network("connection reset")),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&UpstreamError::Timeout(Duration::from_secs(30))),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_server_errors_are_transient() {
        for status in [500, 502, 503, 504, 408] {
            assert_eq!(
                UpstreamError::status(status, "oops").class(),
                FailureClass::Transient,
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 409, 422] {
            assert_eq!(
                UpstreamError::status(status, "nope").class(),
                FailureClass::Permanent,
                "status {}",
                status
            );
        }
        assert_eq!(
            UpstreamError::rejected("malformed").class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_forbidden_with_quota_text_is_still_permanent() {
        // Only the explicit variant or 429 signals quota exhaustion.
        let err = UpstreamError::status(403, "API rate limit exceeded");
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[test]
    fn test_rate_limit_signals() {
        assert_eq!(
            UpstreamError::rate_limited(None).class(),
            FailureClass::RateLimited
        );
        assert_eq!(
            UpstreamError::status(429, "slow down").class(),
            FailureClass::RateLimited
        );
        assert!(!FailureClass::RateLimited.is_retryable());
        assert!(!FailureClass::RateLimited.counts_against_breaker());
    }

    #[test]
    fn test_reset_at_only_on_rate_limit() {
        let at = Utc::now();
        assert_eq!(UpstreamError::rate_limited(Some(at)).reset_at(), Some(at));
        assert_eq!(UpstreamError::status(500, "x").reset_at(), None);
        assert_eq!(UpstreamError::status(500, "x").status_code(), Some(500));
    }
}
