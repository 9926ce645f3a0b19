//! Structured span definitions for governed calls.

use std::time::Instant;

use tracing::{Level, Span, field, span};

/// Span wrapping one governed call from admission to outcome.
pub struct CallSpan {
    span: Span,
    start: Instant,
}

impl CallSpan {
    pub fn new(tenant_id: &str, operation: &'static str) -> Self {
        let span = span!(
            Level::INFO,
            "governor.call",
            tenant = tenant_id,
            operation = operation,
            otel.name = format!("governor.{}", operation),
            attempts = field::Empty,
            outcome = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn finish(self, outcome: &'static str) -> f64 {
        let latency_ms = self.elapsed_ms();
        self.span.record("outcome", outcome);
        self.span.record("latency_ms", latency_ms as u64);
        latency_ms
    }
}

/// Records the attempt count on the enclosing call span, if any.
pub(crate) fn record_attempts(attempts: u32) {
    Span::current().record("attempts", attempts);
}
