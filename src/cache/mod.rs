//! Fingerprint-keyed volume caching
//!
//! A get step caches what it fetched in a worker volume tagged with the
//! resource's fingerprint. A later step with the same fingerprint adopts the
//! volume instead of fetching again.
//!
//! # Cache States
//!
//! | State | Fetch | Description |
//! |-------|-------|-------------|
//! | Miss | runs | No warm volume, a fresh one was created |
//! | Building | - | Fetch in progress, crashed or failed; never adopted |
//! | Complete | skipped | Marked `initialized`, reusable |

pub mod fingerprint;
pub mod local;
pub mod volume;

pub use fingerprint::{Fingerprint, ResourceIdentity};
pub use local::{FetchRecord, LocalVolume, LocalVolumeStore, VolumeRecord};
pub use volume::{
    properties, CacheState, CachedVolume, Volume, VolumeCache, VolumeMount, VolumeProperties,
    VolumeSpec, VolumeStore, GET_MOUNT_PATH, HEARTBEAT_INTERVAL, VOLUME_TTL_SECS,
};
