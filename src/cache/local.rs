//! Directory-backed volume store for a single host
//!
//! Layout under the store root:
//!
//! | Path | Contents |
//! |------|----------|
//! | `<handle>/data/` | Volume contents, mounted into the fetch |
//! | `<handle>/volume.json` | Handle, properties and lease |
//! | `<handle>/result.json` | Version and metadata of the last fetch |

use crate::cache::volume::{CacheState, Volume, VolumeProperties, VolumeSpec, VolumeStore};
use crate::clock::Clock;
use crate::error::{GantryError, GantryResult};
use crate::resource::{MetadataField, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_FILE: &str = "volume.json";
const RESULT_FILE: &str = "result.json";
const DATA_DIR: &str = "data";

/// Persisted description of a local volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub handle: String,
    pub properties: VolumeProperties,
    pub ttl_secs: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VolumeRecord {
    /// Whether the lease has run out at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the volume carries every one of `query`
    pub fn matches(&self, query: &VolumeProperties) -> bool {
        query
            .iter()
            .all(|(key, value)| self.properties.get(key) == Some(value))
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_properties(&self.properties)
    }
}

/// Version and metadata recorded after a fetch into a volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchRecord {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// Volume store keeping each volume in a directory under `root`
#[derive(Clone)]
pub struct LocalVolumeStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LocalVolumeStore {
    pub fn new(root: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            clock,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_dir(&self, handle: &str) -> PathBuf {
        self.root.join(handle)
    }

    /// Directory holding the volume's contents
    pub fn data_dir(&self, handle: &str) -> PathBuf {
        self.volume_dir(handle).join(DATA_DIR)
    }

    async fn read_record(&self, handle: &str) -> GantryResult<VolumeRecord> {
        let path = self.volume_dir(handle).join(RECORD_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GantryError::VolumeNotFound(handle.to_string()))
            }
            Err(e) => {
                return Err(GantryError::io(
                    format!("reading volume record {}", path.display()),
                    e,
                ))
            }
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_record(&self, record: &VolumeRecord) -> GantryResult<()> {
        let dir = self.volume_dir(&record.handle);
        let tmp = dir.join(format!("{}.tmp", RECORD_FILE));
        let content = serde_json::to_string_pretty(record)?;

        fs::write(&tmp, content)
            .await
            .map_err(|e| GantryError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, dir.join(RECORD_FILE))
            .await
            .map_err(|e| GantryError::io(format!("renaming {}", tmp.display()), e))?;
        Ok(())
    }

    /// Push the lease of `handle` out to `now + ttl`
    async fn renew(&self, handle: &str, now: DateTime<Utc>) -> GantryResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_record(handle).await?;
        record.expires_at = now + lease(record.ttl_secs);
        self.write_record(&record).await?;
        debug!("Renewed lease of volume {} until {}", handle, record.expires_at);
        Ok(())
    }

    /// All volumes, expired or not, oldest first
    pub async fn list(&self) -> GantryResult<Vec<VolumeRecord>> {
        if !self.root.exists() {
            return Ok(vec![]);
        }

        let mut records = vec![];
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| GantryError::io("reading volume store directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GantryError::io("reading volume store entry", e))?
        {
            let handle = entry.file_name().to_string_lossy().to_string();
            match self.read_record(&handle).await {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping {}: {}", handle, e),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Remove volumes whose lease has run out
    ///
    /// Returns the removed (or, on a dry run, removable) volumes.
    pub async fn reap_expired(&self, dry_run: bool) -> GantryResult<Vec<VolumeRecord>> {
        let now = self.clock.now();
        let expired: Vec<VolumeRecord> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();

        if !dry_run {
            let _guard = self.write_lock.lock().await;
            for record in &expired {
                let dir = self.volume_dir(&record.handle);
                fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| GantryError::io(format!("removing {}", dir.display()), e))?;
                info!("Reaped expired volume {}", record.handle);
            }
        }

        Ok(expired)
    }

    /// Remember what a fetch into `handle` produced
    pub async fn record_fetch(&self, handle: &str, fetch: &FetchRecord) -> GantryResult<()> {
        let path = self.volume_dir(handle).join(RESULT_FILE);
        let content = serde_json::to_string_pretty(fetch)?;
        fs::write(&path, content)
            .await
            .map_err(|e| GantryError::io(format!("writing {}", path.display()), e))
    }

    /// What the last fetch into `handle` produced, if anything
    pub fn fetch_record(&self, handle: &str) -> Option<FetchRecord> {
        let path = self.volume_dir(handle).join(RESULT_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn open(&self, handle: String) -> Arc<dyn Volume> {
        Arc::new(LocalVolume {
            handle,
            store: self.clone(),
            heartbeat: Mutex::new(None),
        })
    }
}

fn lease(ttl_secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000))
}

#[async_trait]
impl VolumeStore for LocalVolumeStore {
    async fn find_volumes(
        &self,
        properties: &VolumeProperties,
    ) -> GantryResult<Vec<Arc<dyn Volume>>> {
        let now = self.clock.now();
        let volumes = self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_expired(now) && r.matches(properties))
            .map(|r| self.open(r.handle))
            .collect();
        Ok(volumes)
    }

    async fn create_empty_volume(&self, spec: VolumeSpec) -> GantryResult<Arc<dyn Volume>> {
        let handle = Uuid::new_v4().to_string();
        let data = self.data_dir(&handle);
        fs::create_dir_all(&data)
            .await
            .map_err(|e| GantryError::io(format!("creating {}", data.display()), e))?;

        let now = self.clock.now();
        let record = VolumeRecord {
            handle: handle.clone(),
            properties: spec.properties,
            ttl_secs: spec.ttl_secs,
            created_at: now,
            expires_at: now + lease(spec.ttl_secs),
        };

        {
            let _guard = self.write_lock.lock().await;
            self.write_record(&record).await?;
        }

        debug!("Created volume {} in {}", handle, self.root.display());
        Ok(self.open(handle))
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> GantryResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_record(handle).await?;
        record.properties.insert(name.to_string(), value.to_string());
        self.write_record(&record).await
    }
}

/// Handle to one local volume
pub struct LocalVolume {
    handle: String,
    store: LocalVolumeStore,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl LocalVolume {
    pub fn data_dir(&self) -> PathBuf {
        self.store.data_dir(&self.handle)
    }
}

impl Volume for LocalVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn heartbeat(&self, interval: Duration, clock: Arc<dyn Clock>) {
        let store = self.store.clone();
        let handle = self.handle.clone();

        let task = tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                if let Err(e) = store.renew(&handle, clock.now()).await {
                    warn!("Failed to heartbeat volume {}: {}", handle, e);
                }
            }
        });

        if let Some(previous) = self.heartbeat.lock().replace(task) {
            previous.abort();
        }
    }

    fn release(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
            debug!("Stopped heartbeating volume {}", self.handle);
        }
    }
}

impl Drop for LocalVolume {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.get_mut().take() {
            task.abort();
        }
    }
}
