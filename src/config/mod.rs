//! Configuration management for Gantry

pub mod schema;

pub use schema::Config;

use crate::error::{GantryError, GantryResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gantry")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gantry")
    }

    /// Volume store root for `config`
    pub fn volumes_dir(config: &Config) -> PathBuf {
        config
            .cache
            .root
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("volumes"))
    }

    /// Ephemeral fetch directory for `config`
    pub fn work_dir(config: &Config) -> PathBuf {
        config
            .worker
            .work_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("work"))
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> GantryResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> GantryResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| GantryError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| GantryError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> GantryResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            GantryError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> GantryResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| GantryError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: Arc::new(e),
                })?;
        }
        Ok(())
    }

    /// Ensure the volume and work directories for `config` exist
    pub async fn ensure_state_dirs(config: &Config) -> GantryResult<()> {
        let dirs = [Self::volumes_dir(config), Self::work_dir(config)];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                GantryError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.worker.name, "local");
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.worker.name = "builder-1".to_string();
        config
            .resource_types
            .insert("git".to_string(), PathBuf::from("/opt/git/in"));

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.worker.name, "builder-1");
        assert_eq!(loaded.resource_types.len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[worker\nname = 1").unwrap();

        let err = ConfigManager::with_path(path.clone()).load().await.unwrap_err();
        assert!(matches!(err, GantryError::ConfigInvalid { path: ref p, .. } if *p == path));
    }

    #[test]
    fn explicit_dirs_override_state_dir() {
        let mut config = Config::default();
        config.cache.root = Some(PathBuf::from("/tmp/volumes"));
        config.worker.work_dir = Some(PathBuf::from("/tmp/work"));

        assert_eq!(ConfigManager::volumes_dir(&config), PathBuf::from("/tmp/volumes"));
        assert_eq!(ConfigManager::work_dir(&config), PathBuf::from("/tmp/work"));
    }
}
