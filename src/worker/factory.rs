//! Backend factory for the local worker
//!
//! Wires the configured worker, volume store and script tracker together.

use crate::cache::LocalVolumeStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigManager};
use crate::error::GantryResult;
use crate::resource::{ResourceType, ScriptTrackerFactory};
use crate::worker::{LocalWorker, LocalWorkerClient};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a get step needs to run on this machine
pub struct LocalBackend {
    pub worker_client: Arc<LocalWorkerClient>,
    pub tracker_factory: Arc<ScriptTrackerFactory>,
    pub clock: Arc<dyn Clock>,
    /// Volume store, when caching is enabled
    pub store: Option<LocalVolumeStore>,
}

/// Create the local backend described by `config`
///
/// Resource types whose script does not exist are still registered; the
/// missing script surfaces as a command failure when a fetch is attempted.
pub fn create_backend(config: &Config) -> GantryResult<LocalBackend> {
    create_backend_with_clock(config, Arc::new(SystemClock))
}

/// Create the local backend with an explicit clock
pub fn create_backend_with_clock(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> GantryResult<LocalBackend> {
    let scripts: BTreeMap<ResourceType, _> = config
        .resource_types
        .iter()
        .map(|(name, path)| {
            if !path.exists() {
                warn!("Script for resource type {} not found: {}", name, path.display());
            }
            (ResourceType::new(name.as_str()), path.clone())
        })
        .collect();

    let store = if config.cache.enabled {
        let root = ConfigManager::volumes_dir(config);
        debug!("Volume store at {}", root.display());
        Some(LocalVolumeStore::new(root, Arc::clone(&clock)))
    } else {
        debug!("Volume caching disabled");
        None
    };

    let worker = Arc::new(LocalWorker::new(
        config.worker.name.clone(),
        config.worker.tags.clone(),
        scripts.keys().cloned(),
        store.clone(),
    ));

    let tracker_factory = Arc::new(ScriptTrackerFactory::new(
        scripts,
        ConfigManager::work_dir(config),
        store.clone(),
    ));

    Ok(LocalBackend {
        worker_client: Arc::new(LocalWorkerClient::new(vec![worker])),
        tracker_factory,
        clock,
        store,
    })
}
