//! Configuration provider trait.

use serde::de::DeserializeOwned;

use super::{ConfigError, ConfigResult};

/// Read-only source of dotted configuration keys (`retry.count`).
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Raw string value for `key`, or `None` if this provider lacks it
    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    /// Eagerly loads backing data. Providers without a backing store have
    /// nothing to do.
    async fn load(&self) -> ConfigResult<()> {
        Ok(())
    }
}

/// Typed access on top of [`ConfigProvider::get_raw`].
pub trait ConfigProviderExt: ConfigProvider {
    /// Parses the raw value as JSON, so `"3"` reads as a number and
    /// `"true"` as a boolean.
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            match self.get_raw(key).await? {
                Some(raw) => {
                    let value: T =
                        serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                            key: key.to_string(),
                            message: e.to_string(),
                        })?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}
