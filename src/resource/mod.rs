//! Resources: typed fetch scripts running on a worker
//!
//! A [`Tracker`] bound to a worker acquires a [`Resource`] handle; asking the
//! resource to `get` a version yields a [`VersionedSource`], which is both the
//! runnable fetch and the resulting filesystem.

mod script;

pub use script::{FetchRequest, FetchResponse, ScriptTracker, ScriptTrackerFactory};

use crate::cache::VolumeMount;
use crate::error::GantryResult;
use crate::exec::{ByteStream, Ready, Signals, Sink, StepMetadata};
use crate::worker::Worker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Version of a resource, e.g. `{"ref": "abc123"}`
pub type Version = BTreeMap<String, String>;

/// Resource source configuration
pub type Source = BTreeMap<String, serde_json::Value>;

/// Parameters for a single fetch
pub type Params = BTreeMap<String, serde_json::Value>;

/// Name of a resource type (e.g. "git")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One name/value pair of fetch metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Caller-assigned identity of the container session a resource runs in
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub name: String,
    pub build_id: Option<u64>,
}

impl SessionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            build_id: None,
        }
    }
}

/// Session handed to a tracker
///
/// Ephemeral sessions may be reaped as soon as they finish; get steps always
/// use durable sessions so their containers and volumes can be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub ephemeral: bool,
}

/// Output sinks forwarded to a running fetch
#[derive(Debug, Clone)]
pub struct IoConfig {
    pub stdout: Sink,
    pub stderr: Sink,
}

/// Acquires resource handles on one worker
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn init(
        &self,
        metadata: &StepMetadata,
        session: Session,
        resource_type: &ResourceType,
        tags: &[String],
        mount: Option<VolumeMount>,
    ) -> GantryResult<Arc<dyn Resource>>;
}

/// Hands out the tracker for a selected worker
pub trait TrackerFactory: Send + Sync {
    fn tracker_for(&self, worker: Arc<dyn Worker>) -> Arc<dyn Tracker>;
}

/// An acquired resource handle
#[async_trait]
pub trait Resource: Send + Sync {
    /// Prepare a fetch of `version` (latest when absent)
    fn get(
        &self,
        io: IoConfig,
        source: &Source,
        params: &Params,
        version: Option<&Version>,
    ) -> Arc<dyn VersionedSource>;

    /// Handles of the volumes the resource has touched
    async fn volume_handles(&self) -> GantryResult<Vec<String>>;

    /// Drop the handle and whatever container backs it
    async fn release(&self);
}

/// A fetch and the filesystem it produces
#[async_trait]
pub trait VersionedSource: Send + Sync {
    /// Run the fetch
    ///
    /// Raises `ready` once started; a non-zero script exit is reported as
    /// `GantryError::ResourceScriptFailed`.
    async fn run(&self, signals: Signals, ready: Ready) -> GantryResult<()>;

    /// Version that was fetched
    fn version(&self) -> Version;

    /// Metadata reported by the fetch
    fn metadata(&self) -> Vec<MetadataField>;

    /// Tar stream of `path` within the fetched filesystem
    async fn stream_out(&self, path: &str) -> GantryResult<Box<dyn ByteStream>>;
}
