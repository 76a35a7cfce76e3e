// Storage configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Which store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Local,
    Remote,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory that local dataset IDs are resolved against
    pub root: PathBuf,

    #[serde(default)]
    pub store_type: StoreKind,

    /// Required when `store_type = "remote"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
}

/// Connection and cache settings of a remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Server directory holding the catalog and objects
    pub server: PathBuf,

    /// Local cache of downloaded file-sets
    pub cache_dir: PathBuf,

    pub user: String,

    pub password: String,

    /// Seconds without progress before a sibling download counts as stalled
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// How often a waiting download polls its sibling
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl RemoteConfig {
    pub fn new(server: PathBuf, cache_dir: PathBuf, user: String, password: String) -> Self {
        Self {
            server,
            cache_dir,
            user,
            password,
            stall_timeout_secs: default_stall_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StorageConfig {
    /// Load configuration with the following priority:
    /// 1. DSTORE_ROOT environment variable (local store)
    /// 2. config.toml file
    /// 3. Default: ~/.cache/dstore
    pub async fn load() -> Result<Self> {
        if let Ok(env_path) = std::env::var("DSTORE_ROOT") {
            return Ok(Self {
                root: PathBuf::from(env_path),
                store_type: StoreKind::Local,
                remote: None,
            });
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let content = fs::read_to_string(&config_path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                return Self::parse(&content)
                    .with_context(|| format!("Failed to parse config file: {}", config_path.display()));
            }
        }

        Ok(Self::default())
    }

    /// Parse TOML, checking that a remote store has its settings
    pub fn parse(content: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(content)?;
        if config.store_type == StoreKind::Remote && config.remote.is_none() {
            anyhow::bail!("store_type = \"remote\" requires a [remote] table");
        }
        Ok(config)
    }

    /// Get the config file path (~/.config/dstore/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dstore").join("config.toml"))
    }

    /// Save configuration to the config file, returning its path
    pub async fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_file_path()
            .context("Failed to determine config directory")?;
        self.save_to(&config_path).await?;
        Ok(config_path)
    }

    pub async fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dstore");

        Self {
            root,
            store_type: StoreKind::Local,
            remote: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.store_type, StoreKind::Local);
        assert!(config.root.ends_with("dstore"));
    }

    #[test]
    fn test_parse_remote_config() {
        let config = StorageConfig::parse(
            r#"
            root = "/data"
            store_type = "remote"

            [remote]
            server = "/srv/catalog"
            cache_dir = "/tmp/cache"
            user = "tester"
            password = "secret"
            stall_timeout_secs = 30
            "#,
        )
        .unwrap();

        let remote = config.remote.unwrap();
        assert_eq!(remote.stall_timeout(), Duration::from_secs(30));
        assert_eq!(remote.poll_interval(), Duration::from_millis(500));
        assert_eq!(remote.server, PathBuf::from("/srv/catalog"));
    }

    #[test]
    fn test_remote_without_settings_rejected() {
        assert!(StorageConfig::parse("root = \"/data\"\nstore_type = \"remote\"\n").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = StorageConfig {
            root: PathBuf::from("/tmp/test-dstore"),
            store_type: StoreKind::Local,
            remote: None,
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = StorageConfig::parse(&text).unwrap();
        assert_eq!(parsed.root, config.root);
        assert_eq!(parsed.store_type, StoreKind::Local);
    }

    #[tokio::test]
    async fn test_save_to_writes_loadable_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");
        let config = StorageConfig {
            root: PathBuf::from("/data"),
            store_type: StoreKind::Remote,
            remote: Some(RemoteConfig::new(
                PathBuf::from("/srv/catalog"),
                PathBuf::from("/tmp/cache"),
                "tester".into(),
                "secret".into(),
            )),
        };

        config.save_to(&path).await.unwrap();

        let parsed = StorageConfig::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.store_type, StoreKind::Remote);
        assert_eq!(parsed.remote, config.remote);
    }

    #[tokio::test]
    async fn test_load_from_env() {
        std::env::set_var("DSTORE_ROOT", "/tmp/env-test");

        let config = StorageConfig::load().await.unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/env-test"));

        std::env::remove_var("DSTORE_ROOT");
    }
}
