//! Exponential backoff strategy for retry policies.

use std::time::Duration;

/// `initial * factor^(attempt-1)`, capped at `max`, plus up to `jitter`
/// of the capped delay added at random.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64()
            * self.factor.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let clamped = base.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            clamped + rand::random::<f64>() * clamped * self.jitter
        } else {
            clamped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}
