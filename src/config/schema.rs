//! Configuration schema for Gantry
//!
//! Configuration is stored at `~/.config/gantry/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local worker settings
    pub worker: WorkerConfig,

    /// Volume cache settings
    pub cache: CacheConfig,

    /// Resource type name -> path of its fetch script
    pub resource_types: BTreeMap<String, PathBuf>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Local worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name reported in logs
    pub name: String,

    /// Placement tags this worker carries
    pub tags: Vec<String>,

    /// Directory for ephemeral fetches (default: state dir)
    pub work_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            tags: vec![],
            work_dir: None,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable volume caching (default: true)
    pub enabled: bool,

    /// Volume store root (default: state dir)
    pub root: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
        }
    }
}
