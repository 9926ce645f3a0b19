//! Typed governor settings loaded from any [`ConfigProvider`].

use std::time::Duration;

use serde_json::{Map, Value};

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::validator::{ConfigValidator, ValueType, get_nested};
use super::{ConfigError, ConfigResult};
use crate::quota::QuotaConfig;
use crate::resilience::{
    BulkheadConfig, CircuitConfig, ExponentialBackoff, ResilienceConfig, RetryConfig,
};

const INTEGER_KEYS: &[(&str, i64, i64)] = &[
    ("retry.count", 0, 100),
    ("circuit_breaker.failure_threshold", 1, u32::MAX as i64),
    ("bulkhead.max_concurrent", 1, 100_000),
    ("bulkhead.max_queued", 0, 1_000_000),
    ("quota.max_requests_per_window", 1, u32::MAX as i64),
    ("quota.warning_threshold", 0, u32::MAX as i64),
];

/// Durations in seconds; fractions are allowed.
const SECONDS_KEYS: &[&str] = &[
    "retry.delay_seconds",
    "retry.max_delay_seconds",
    "circuit_breaker.sampling_seconds",
    "circuit_breaker.duration_seconds",
    "timeout_seconds",
    "quota.window_seconds",
    "quota.reset_buffer_seconds",
];

/// Upper bound for every seconds key. Larger values overflow instant
/// arithmetic.
const MAX_SECONDS: f64 = 10.0 * 365.0 * 24.0 * 3600.0;

/// Keys that may be zero.
const ZERO_SECONDS_OK: &[&str] = &["retry.delay_seconds", "quota.reset_buffer_seconds"];

const RATIO_KEYS: &[&str] = &["retry.jitter", "circuit_breaker.failure_ratio"];

/// Everything a [`Governor`](crate::Governor) needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GovernorConfig {
    pub quota: QuotaConfig,
    pub resilience: ResilienceConfig,
}

impl GovernorConfig {
    /// Reads every known key from `provider`, validates, and fills the rest
    /// with defaults. All invalid keys are reported together.
    pub async fn from_provider<P>(provider: &P) -> ConfigResult<Self>
    where
        P: ConfigProvider + ?Sized,
    {
        let mut root = Map::new();
        let keys = INTEGER_KEYS
            .iter()
            .map(|(key, _, _)| *key)
            .chain(SECONDS_KEYS.iter().copied())
            .chain(RATIO_KEYS.iter().copied());
        for key in keys {
            if let Some(value) = provider.get::<Value>(key).await? {
                insert_nested(&mut root, key, value);
            }
        }

        let config = Self::from_value(&Value::Object(root))?;
        tracing::debug!(provider = provider.name(), ?config, "Loaded governor configuration");
        Ok(config)
    }

    /// Builds from a nested JSON document such as
    /// `{"retry": {"count": 5}, "timeout_seconds": 10}`.
    pub fn from_value(value: &Value) -> ConfigResult<Self> {
        Self::validator().validate(value)?;

        let defaults = Self::default();
        let retry = &defaults.resilience.retry;
        let circuit = &defaults.resilience.circuit;
        let bulkhead = &defaults.resilience.bulkhead;
        let quota = &defaults.quota;

        let initial = seconds(value, "retry.delay_seconds", retry.backoff.initial())?;
        let max_delay = seconds(value, "retry.max_delay_seconds", Duration::from_secs(60))?;
        if max_delay < initial {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_delay_seconds".to_string(),
                message: format!(
                    "{}s is below retry.delay_seconds ({}s)",
                    max_delay.as_secs_f64(),
                    initial.as_secs_f64()
                ),
            });
        }
        let jitter = float(value, "retry.jitter", retry.backoff.jitter());

        Ok(Self {
            quota: QuotaConfig {
                limit: integer(value, "quota.max_requests_per_window", quota.limit)?,
                window: seconds(value, "quota.window_seconds", quota.window)?,
                warning_threshold: integer(
                    value,
                    "quota.warning_threshold",
                    quota.warning_threshold,
                )?,
                reset_buffer: seconds(value, "quota.reset_buffer_seconds", quota.reset_buffer)?,
            },
            resilience: ResilienceConfig {
                retry: RetryConfig {
                    max_retries: integer(value, "retry.count", retry.max_retries)?,
                    backoff: ExponentialBackoff::new(initial, max_delay, 2.0).with_jitter(jitter),
                },
                circuit: CircuitConfig {
                    min_throughput: integer(
                        value,
                        "circuit_breaker.failure_threshold",
                        circuit.min_throughput,
                    )?,
                    failure_ratio: float(
                        value,
                        "circuit_breaker.failure_ratio",
                        circuit.failure_ratio,
                    ),
                    sampling_window: seconds(
                        value,
                        "circuit_breaker.sampling_seconds",
                        circuit.sampling_window,
                    )?,
                    open_duration: seconds(
                        value,
                        "circuit_breaker.duration_seconds",
                        circuit.open_duration,
                    )?,
                },
                bulkhead: BulkheadConfig {
                    max_concurrent: integer(
                        value,
                        "bulkhead.max_concurrent",
                        bulkhead.max_concurrent,
                    )?,
                    max_queued: integer(value, "bulkhead.max_queued", bulkhead.max_queued)?,
                },
                timeout: seconds(value, "timeout_seconds", defaults.resilience.timeout)?,
            },
        })
    }

    pub fn validator() -> ConfigValidator {
        let mut validator = ConfigValidator::new();

        for (key, min, max) in INTEGER_KEYS {
            validator = validator
                .expect_type(*key, ValueType::Integer)
                .expect_range(*key, *min..=*max);
        }

        for key in SECONDS_KEYS {
            let allow_zero = ZERO_SECONDS_OK.contains(key);
            validator = validator
                .expect_type(*key, ValueType::Number)
                .custom(*key, move |v| match v.as_f64() {
                    Some(s) if s > MAX_SECONDS => Err(format!("must be at most {MAX_SECONDS}s")),
                    Some(s) if s > 0.0 => Ok(()),
                    Some(s) if s == 0.0 && allow_zero => Ok(()),
                    Some(_) if allow_zero => Err("must be a non-negative duration".to_string()),
                    Some(_) => Err("must be a positive duration".to_string()),
                    None => Ok(()),
                });
        }

        validator
            .expect_type("retry.jitter", ValueType::Number)
            .custom("retry.jitter", |v| match v.as_f64() {
                Some(j) if !(0.0..=1.0).contains(&j) => Err("must be in [0, 1]".to_string()),
                _ => Ok(()),
            })
            .expect_type("circuit_breaker.failure_ratio", ValueType::Number)
            .custom("circuit_breaker.failure_ratio", |v| match v.as_f64() {
                Some(r) if r <= 0.0 || r > 1.0 => Err("must be in (0, 1]".to_string()),
                _ => Ok(()),
            })
    }
}

fn insert_nested(root: &mut Map<String, Value>, key: &str, value: Value) {
    let mut parts = key.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
}

fn integer<T>(value: &Value, key: &str, default: T) -> ConfigResult<T>
where
    T: TryFrom<u64>,
{
    match get_nested(value, key).and_then(Value::as_u64) {
        Some(n) => T::try_from(n).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{} is out of range", n),
        }),
        None => Ok(default),
    }
}

fn float(value: &Value, key: &str, default: f64) -> f64 {
    get_nested(value, key)
        .and_then(Value::as_f64)
        .unwrap_or(default)
}

fn seconds(value: &Value, key: &str, default: Duration) -> ConfigResult<Duration> {
    match get_nested(value, key).and_then(Value::as_f64) {
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
