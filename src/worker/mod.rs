//! Worker selection
//!
//! Provides the placement contracts get steps rely on:
//! - [`WorkerClient`] picks a worker for a resource type and tag set
//! - [`Worker`] optionally exposes a volume store for caching

mod factory;
mod local;

pub use factory::{create_backend, create_backend_with_clock, LocalBackend};
pub use local::{LocalWorker, LocalWorkerClient};

use crate::cache::VolumeStore;
use crate::error::GantryResult;
use crate::resource::ResourceType;
use async_trait::async_trait;
use std::sync::Arc;

/// Placement constraints for a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub resource_type: ResourceType,
    pub tags: Vec<String>,
}

/// A machine that can run steps
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// The worker's volume store, when it supports volume management
    fn volume_manager(&self) -> Option<Arc<dyn VolumeStore>>;
}

/// Entry point to the worker pool
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// A worker meeting `spec`, or `NoCompatibleWorkers`
    async fn satisfying(&self, spec: &WorkerSpec) -> GantryResult<Arc<dyn Worker>>;
}
