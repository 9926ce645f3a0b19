//! Rule-based validation over a nested `serde_json::Value`.
//!
//! Rules run in the order they were added and every failure is collected,
//! so one pass reports all bad keys. Type, range and custom rules only apply
//! to keys that are present.

use std::ops::RangeInclusive;

use serde_json::Value;

use super::{ConfigError, ConfigResult, ValidationErrors};

pub type ValidationFn = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

enum Rule {
    Required,
    Type(ValueType),
    Range(RangeInclusive<i64>),
    Custom(ValidationFn),
}

#[derive(Default)]
pub struct ConfigValidator {
    rules: Vec<(String, Rule)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    /// A number with no fractional part.
    Integer,
    Boolean,
    Object,
}

impl ValueType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
        }
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(mut self, key: impl Into<String>, rule: Rule) -> Self {
        self.rules.push((key.into(), rule));
        self
    }

    pub fn require(self, key: impl Into<String>) -> Self {
        self.rule(key, Rule::Required)
    }

    pub fn expect_type(self, key: impl Into<String>, value_type: ValueType) -> Self {
        self.rule(key, Rule::Type(value_type))
    }

    /// Integer bounds. Non-integer values are left to the type rule.
    pub fn expect_range(self, key: impl Into<String>, range: RangeInclusive<i64>) -> Self {
        self.rule(key, Rule::Range(range))
    }

    pub fn custom<F>(self, key: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.rule(key, Rule::Custom(Box::new(validator)))
    }

    pub fn validate(&self, config: &Value) -> ConfigResult<()> {
        let errors = self.collect_errors(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }

    pub fn validate_partial(&self, config: &Value) -> Vec<ConfigError> {
        self.collect_errors(config)
    }

    fn collect_errors(&self, config: &Value) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        for (key, rule) in &self.rules {
            let value = get_nested(config, key);
            let message = match (rule, value) {
                (Rule::Required, None) => {
                    errors.push(ConfigError::NotFound { key: key.clone() });
                    continue;
                }
                (Rule::Type(expected), Some(value)) if !expected.matches(value) => format!(
                    "expected {}, got {}",
                    expected.name(),
                    value_type_name(value)
                ),
                (Rule::Range(range), Some(value)) => match value.as_i64() {
                    Some(num) if !range.contains(&num) => format!(
                        "value {} not in range {}..={}",
                        num,
                        range.start(),
                        range.end()
                    ),
                    _ => continue,
                },
                (Rule::Custom(validator), Some(value)) => match validator(value) {
                    Err(msg) => msg,
                    Ok(()) => continue,
                },
                _ => continue,
            };
            errors.push(ConfigError::InvalidValue {
                key: key.clone(),
                message,
            });
        }

        errors
    }
}

impl std::fmt::Debug for ConfigValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigValidator")
            .field("rules", &self.rules.len())
            .finish()
    }
}

pub(crate) fn get_nested<'a>(config: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = config;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
