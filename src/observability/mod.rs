//! Observability for the governor.
//!
//! - **Metrics**: process-wide atomic counters, gauges and a latency histogram
//! - **Spans**: one `governor.call` span per governed call, carrying the
//!   tenant, attempt count and outcome
//!
//! Log events are emitted through `tracing`; install any subscriber to see
//! them.

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, InFlightCall, MetricsRegistry, MetricsSummary};
pub use spans::CallSpan;

pub(crate) use spans::record_attempts;
