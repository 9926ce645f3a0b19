//! Pluggable configuration providers.
//!
//! ```rust,no_run
//! use tenant_governor::config::{ConfigBuilder, GovernorConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ConfigBuilder::new()
//!     .env_with_prefix("GOVERNOR_")
//!     .file("governor.json")
//!     .build()
//!     .await?;
//! let config = GovernorConfig::from_provider(&provider).await?;
//! # Ok(())
//! # }
//! ```

pub mod composite;
pub mod env;
pub mod file;
mod governor;
pub mod memory;
pub mod provider;
pub mod validator;

pub use composite::CompositeConfigProvider;
pub use env::EnvConfigProvider;
pub use file::FileConfigProvider;
pub use governor::GovernorConfig;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};
pub use validator::{ConfigValidator, ValueType};

use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required key is absent from every provider
    #[error("Key not found: {key}")]
    NotFound {
        /// The dotted key that was looked up
        key: String,
    },

    /// A key is present but its value is unusable
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The dotted key with the bad value
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// Malformed JSON in a config file
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment variable present but not valid unicode
    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    /// Every failure from one validation pass
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

/// Failures collected by [`ConfigValidator`], in rule order.
#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Layers providers; the first one added wins on conflicting keys.
pub struct ConfigBuilder {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Add unprefixed environment variables (`RETRY_COUNT`)
    pub fn env(mut self) -> Self {
        self.providers.push(Box::new(EnvConfigProvider::new()));
        self
    }

    /// `retry.count` is read from `{prefix}RETRY_COUNT`.
    pub fn env_with_prefix(mut self, prefix: &str) -> Self {
        self.providers
            .push(Box::new(EnvConfigProvider::prefixed(prefix)));
        self
    }

    /// Add a JSON file layer; a missing file contributes nothing
    pub fn file(mut self, path: impl AsRef<std::path::Path>) -> Self {
        self.providers.push(Box::new(FileConfigProvider::new(
            path.as_ref().to_path_buf(),
        )));
        self
    }

    /// Add an in-memory layer
    pub fn memory(mut self, provider: MemoryConfigProvider) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Add a custom provider
    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Builds the composite provider, loading every file layer up front so
    /// a malformed file fails here rather than on first read.
    pub async fn build(self) -> ConfigResult<CompositeConfigProvider> {
        let mut composite = CompositeConfigProvider::new();
        for provider in self.providers {
            provider.load().await?;
            composite.add_provider(provider);
        }
        tracing::debug!(providers = ?composite.provider_names(), "Configuration providers ready");
        Ok(composite)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "retry.count".to_string(),
            message: "expected number".to_string(),
        };
        assert!(err.to_string().contains("retry.count"));

        let err = ConfigError::ValidationErrors(ValidationErrors(vec![
            ConfigError::NotFound {
                key: "a".to_string(),
            },
            ConfigError::NotFound {
                key: "b".to_string(),
            },
        ]));
        assert_eq!(err.to_string(), "Validation failed: Key not found: a; Key not found: b");
    }

    #[tokio::test]
    async fn test_builder_priority() {
        let provider = ConfigBuilder::new()
            .memory(MemoryConfigProvider::named("high").value("retry.count", "1"))
            .memory(
                MemoryConfigProvider::named("low")
                    .value("retry.count", "9")
                    .value("timeout_seconds", "12"),
            )
            .build()
            .await
            .unwrap();

        assert_eq!(provider.provider_names(), vec!["high", "low"]);
        assert_eq!(provider.get_raw("retry.count").await.unwrap().as_deref(), Some("1"));
        assert_eq!(
            provider.get_raw("timeout_seconds").await.unwrap().as_deref(),
            Some("12")
        );
    }
}
