//! In-memory configuration provider, for tests and code-defined settings.

use std::collections::HashMap;

use super::ConfigResult;
use super::provider::ConfigProvider;

/// Keys and raw values held in a map.
#[derive(Debug, Clone)]
pub struct MemoryConfigProvider {
    data: HashMap<String, String>,
    name: String,
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Same as [`new`](Self::new) but logged under `name`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            data: HashMap::new(),
            name: name.into(),
        }
    }

    pub fn from_data(data: HashMap<String, String>) -> Self {
        Self {
            data,
            name: "memory".to_string(),
        }
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for MemoryConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for MemoryConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.data.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::provider::ConfigProviderExt;

    #[tokio::test]
    async fn test_memory_provider_basic() {
        let provider = MemoryConfigProvider::new().value("retry.count", "4");
        assert_eq!(
            provider.get_raw("retry.count").await.unwrap(),
            Some("4".to_string())
        );
        assert_eq!(provider.get_raw("nonexistent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_provider_typed() {
        let provider = MemoryConfigProvider::new()
            .value("retry.count", "4")
            .value("retry.jitter", "0.25")
            .value("bad", "not json");

        let count: Option<u32> = provider.get("retry.count").await.unwrap();
        assert_eq!(count, Some(4));
        let jitter: Option<f64> = provider.get("retry.jitter").await.unwrap();
        assert_eq!(jitter, Some(0.25));
        assert!(provider.get::<u32>("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_provider_with_data() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), "1".to_string());
        data.insert("b".to_string(), "2".to_string());

        let mut provider = MemoryConfigProvider::from_data(data);
        provider.insert("c", "3");
        assert_eq!(provider.len(), 3);
        assert_eq!(provider.get_raw("c").await.unwrap(), Some("3".to_string()));
    }
}
