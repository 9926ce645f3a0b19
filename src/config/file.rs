//! JSON file configuration provider.
//!
//! Dotted keys address nested objects, so `retry.count` may be written as
//! `{"retry": {"count": 3}}`. A top-level key containing the dot
//! (`{"retry.count": 3}`) is also accepted and takes precedence.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use super::ConfigResult;
use super::provider::ConfigProvider;

/// Reads a JSON object from disk once, on first use or on `load`.
pub struct FileConfigProvider {
    path: PathBuf,
    data: OnceCell<Map<String, Value>>,
}

impl FileConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            data: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// A missing file reads as empty; an unreadable or malformed one is an
    /// error.
    async fn read_file(&self) -> ConfigResult<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            tracing::debug!(path = %self.path.display(), "Config file not found; skipping");
            return Ok(Map::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let data: Map<String, Value> = serde_json::from_str(&content)?;
        tracing::debug!(path = %self.path.display(), keys = data.len(), "Loaded config file");
        Ok(data)
    }

    async fn data(&self) -> ConfigResult<&Map<String, Value>> {
        self.data.get_or_try_init(|| self.read_file()).await
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(key) {
        return Some(value);
    }
    let mut parts = key.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

#[async_trait::async_trait]
impl ConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        let data = self.data().await?;
        Ok(match lookup(data, key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(v) => Some(v.to_string()),
        })
    }

    async fn load(&self) -> ConfigResult<()> {
        self.data().await.map(|_| ())
    }
}

impl std::fmt::Debug for FileConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConfigProvider")
            .field("path", &self.path)
            .field("loaded", &self.data.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_provider_nested_and_flat_keys() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("governor.json");

        let config = serde_json::json!({
            "timeout_seconds": 15,
            "retry": { "count": 5, "jitter": 0.2 },
            "quota.window_seconds": 60,
            "name": "primary"
        });
        tokio::fs::write(&config_path, config.to_string())
            .await
            .unwrap();

        let provider = FileConfigProvider::new(config_path);
        assert_eq!(
            provider.get_raw("timeout_seconds").await.unwrap(),
            Some("15".to_string())
        );
        assert_eq!(
            provider.get_raw("retry.count").await.unwrap(),
            Some("5".to_string())
        );
        assert_eq!(
            provider.get_raw("retry.jitter").await.unwrap(),
            Some("0.2".to_string())
        );
        assert_eq!(
            provider.get_raw("quota.window_seconds").await.unwrap(),
            Some("60".to_string())
        );
        assert_eq!(
            provider.get_raw("name").await.unwrap(),
            Some("primary".to_string())
        );
        assert_eq!(provider.get_raw("retry.missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_provider_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FileConfigProvider::new(temp_dir.path().join("nonexistent.json"));
        assert!(provider.load().await.is_ok());
        assert_eq!(provider.get_raw("retry.count").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_provider_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("broken.json");
        tokio::fs::write(&config_path, "{ not json").await.unwrap();

        let provider = FileConfigProvider::new(config_path);
        assert!(provider.load().await.is_err());
    }
}
