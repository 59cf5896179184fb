//! Cache volume state management
//!
//! Resolves a fingerprint to a warm cache volume or a fresh one, and owns the
//! contracts a worker's volume store has to meet.

use crate::cache::fingerprint::Fingerprint;
use crate::clock::Clock;
use crate::error::GantryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where a get step's volume is mounted inside the fetch container
pub const GET_MOUNT_PATH: &str = "/tmp/build/get";

/// How often a leased volume is heartbeated
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Lease a fresh cache volume is created with
pub const VOLUME_TTL_SECS: u64 = 60 * 60 * 24;

/// Volume property keys used to match cache volumes
pub mod properties {
    /// The resource type
    pub const RESOURCE_TYPE: &str = "resource-type";
    /// Canonical JSON of the fetched version
    pub const RESOURCE_VERSION: &str = "resource-version";
    /// Canonical JSON of the source config
    pub const RESOURCE_SOURCE: &str = "resource-source";
    /// Canonical JSON of the fetch params
    pub const RESOURCE_PARAMS: &str = "resource-params";
    /// Set once a fetch into the volume has succeeded
    pub const INITIALIZED: &str = "initialized";
    /// Value of the `initialized` marker
    pub const INITIALIZED_VALUE: &str = "yep";
}

/// String properties attached to a volume
pub type VolumeProperties = BTreeMap<String, String>;

/// State of a cache volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// No warm volume existed; a fresh one was created
    Miss,
    /// Volume exists but no fetch into it has completed
    Building,
    /// Volume is initialized and reusable
    Complete,
}

impl CacheState {
    /// Derive the state of an existing volume from its properties
    pub fn from_properties(props: &VolumeProperties) -> Self {
        match props.get(properties::INITIALIZED).map(String::as_str) {
            Some(properties::INITIALIZED_VALUE) => Self::Complete,
            _ => Self::Building,
        }
    }

    /// Whether the fetch can be skipped
    pub fn is_warm(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miss => write!(f, "miss"),
            Self::Building => write!(f, "building"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Request for a new empty volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub properties: VolumeProperties,
    pub ttl_secs: u64,
}

/// A leased volume on a worker
pub trait Volume: Send + Sync {
    fn handle(&self) -> &str;

    /// Start renewing the lease every `interval` on `clock`, in the background
    fn heartbeat(&self, interval: Duration, clock: Arc<dyn Clock>);

    /// Drop the lease and stop heartbeating
    fn release(&self);
}

/// A worker's volume management API
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Volumes carrying every one of `properties`
    async fn find_volumes(&self, properties: &VolumeProperties)
        -> GantryResult<Vec<Arc<dyn Volume>>>;

    async fn create_empty_volume(&self, spec: VolumeSpec) -> GantryResult<Arc<dyn Volume>>;

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> GantryResult<()>;
}

/// Volume mount specification for a fetch container
#[derive(Clone)]
pub struct VolumeMount {
    pub volume: Arc<dyn Volume>,
    pub mount_path: String,
}

impl VolumeMount {
    /// Mount `volume` at the get step's mount path
    pub fn for_get(volume: Arc<dyn Volume>) -> Self {
        Self {
            volume,
            mount_path: GET_MOUNT_PATH.to_string(),
        }
    }
}

impl fmt::Debug for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeMount")
            .field("volume", &self.volume.handle())
            .field("mount_path", &self.mount_path)
            .finish()
    }
}

/// A volume resolved for a fingerprint
pub struct CachedVolume {
    pub volume: Arc<dyn Volume>,
    pub state: CacheState,
}

/// Fingerprint-keyed volume lookup on one worker's store
pub struct VolumeCache {
    store: Arc<dyn VolumeStore>,
    clock: Arc<dyn Clock>,
}

impl VolumeCache {
    pub fn new(store: Arc<dyn VolumeStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Adopt the first warm volume for `fingerprint`, or create a fresh one
    ///
    /// Either way the volume is heartbeating when this returns; releasing it
    /// is the caller's job.
    pub async fn resolve(&self, fingerprint: &Fingerprint) -> GantryResult<CachedVolume> {
        let found = self
            .store
            .find_volumes(&fingerprint.initialized_properties())
            .await?;

        let cached = match found.into_iter().next() {
            Some(volume) => {
                info!("Cache hit for {}: volume {}", fingerprint, volume.handle());
                CachedVolume {
                    volume,
                    state: CacheState::Complete,
                }
            }
            None => {
                let volume = self
                    .store
                    .create_empty_volume(VolumeSpec {
                        properties: fingerprint.properties(),
                        ttl_secs: VOLUME_TTL_SECS,
                    })
                    .await?;
                info!("Cache miss for {}: created volume {}", fingerprint, volume.handle());
                CachedVolume {
                    volume,
                    state: CacheState::Miss,
                }
            }
        };

        cached
            .volume
            .heartbeat(HEARTBEAT_INTERVAL, Arc::clone(&self.clock));
        Ok(cached)
    }

    /// Mark `handle` as holding a completed fetch
    pub async fn mark_initialized(&self, handle: &str) -> GantryResult<()> {
        debug!("Marking volume {} initialized", handle);
        self.store
            .set_property(handle, properties::INITIALIZED, properties::INITIALIZED_VALUE)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::ResourceIdentity;
    use crate::clock::SystemClock;
    use crate::exec::fakes::{FakeVolume, FakeVolumeStore};
    use crate::resource::{Params, ResourceType, Source};

    fn fingerprint() -> Fingerprint {
        ResourceIdentity::new(
            ResourceType::new("git"),
            None,
            Source::new(),
            Params::new(),
        )
        .fingerprint()
        .unwrap()
    }

    #[test]
    fn cache_state_from_properties() {
        let fp = fingerprint();
        assert_eq!(
            CacheState::from_properties(&fp.properties()),
            CacheState::Building
        );
        assert_eq!(
            CacheState::from_properties(&fp.initialized_properties()),
            CacheState::Complete
        );
        assert!(CacheState::Complete.is_warm());
        assert!(!CacheState::Miss.is_warm());
    }

    #[test]
    fn mount_debug_shows_handle() {
        let mount = VolumeMount::for_get(Arc::new(FakeVolume::new("vol-1")));
        let debug = format!("{:?}", mount);
        assert!(debug.contains("vol-1"));
        assert!(debug.contains("/tmp/build/get"));
    }

    #[tokio::test]
    async fn resolve_adopts_first_found_volume() {
        let store = Arc::new(FakeVolumeStore::new());
        let first = Arc::new(FakeVolume::new("first"));
        store.set_found(vec![first.clone(), Arc::new(FakeVolume::new("second"))]);

        let cache = VolumeCache::new(store.clone(), Arc::new(SystemClock));
        let cached = cache.resolve(&fingerprint()).await.unwrap();

        assert_eq!(cached.state, CacheState::Complete);
        assert_eq!(cached.volume.handle(), "first");
        assert_eq!(first.heartbeats().len(), 1);
        assert_eq!(first.heartbeats()[0], HEARTBEAT_INTERVAL);
        assert!(store.created().is_empty());
        assert_eq!(store.find_calls(), vec![fingerprint().initialized_properties()]);
    }

    #[tokio::test]
    async fn resolve_creates_without_marker_on_miss() {
        let store = Arc::new(FakeVolumeStore::new());
        let created = Arc::new(FakeVolume::new("created"));
        store.set_created(created.clone());

        let cache = VolumeCache::new(store.clone(), Arc::new(SystemClock));
        let cached = cache.resolve(&fingerprint()).await.unwrap();

        assert_eq!(cached.state, CacheState::Miss);
        assert_eq!(
            store.created(),
            vec![VolumeSpec {
                properties: fingerprint().properties(),
                ttl_secs: 86_400,
            }]
        );
        assert_eq!(created.heartbeats().len(), 1);
        assert!(store.set_property_calls().is_empty());
    }

    #[tokio::test]
    async fn mark_initialized_sets_marker() {
        let store = Arc::new(FakeVolumeStore::new());
        let cache = VolumeCache::new(store.clone(), Arc::new(SystemClock));

        cache.mark_initialized("vol-1").await.unwrap();

        assert_eq!(
            store.set_property_calls(),
            vec![(
                "vol-1".to_string(),
                "initialized".to_string(),
                "yep".to_string()
            )]
        );
    }
}
