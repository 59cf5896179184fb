//! Single-host worker pool

use crate::cache::{LocalVolumeStore, VolumeStore};
use crate::error::{GantryError, GantryResult};
use crate::resource::ResourceType;
use crate::worker::{Worker, WorkerClient, WorkerSpec};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A worker running fetch scripts on this machine
pub struct LocalWorker {
    name: String,
    tags: Vec<String>,
    resource_types: BTreeSet<ResourceType>,
    store: Option<LocalVolumeStore>,
}

impl LocalWorker {
    /// Create a worker; `store` is `None` when caching is disabled
    pub fn new(
        name: impl Into<String>,
        tags: Vec<String>,
        resource_types: impl IntoIterator<Item = ResourceType>,
        store: Option<LocalVolumeStore>,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            resource_types: resource_types.into_iter().collect(),
            store,
        }
    }

    /// Whether this worker can run `spec`
    pub fn satisfies(&self, spec: &WorkerSpec) -> bool {
        self.resource_types.contains(&spec.resource_type)
            && spec.tags.iter().all(|tag| self.tags.contains(tag))
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

impl Worker for LocalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn volume_manager(&self) -> Option<Arc<dyn VolumeStore>> {
        self.store
            .clone()
            .map(|store| Arc::new(store) as Arc<dyn VolumeStore>)
    }
}

/// Worker client over a fixed set of local workers
pub struct LocalWorkerClient {
    workers: Vec<Arc<LocalWorker>>,
}

impl LocalWorkerClient {
    pub fn new(workers: Vec<Arc<LocalWorker>>) -> Self {
        Self { workers }
    }
}

#[async_trait]
impl WorkerClient for LocalWorkerClient {
    async fn satisfying(&self, spec: &WorkerSpec) -> GantryResult<Arc<dyn Worker>> {
        let worker = self
            .workers
            .iter()
            .find(|w| w.satisfies(spec))
            .ok_or_else(|| GantryError::NoCompatibleWorkers {
                resource_type: spec.resource_type.to_string(),
                tags: spec.tags.clone(),
            })?;

        debug!("Selected worker {} for {}", worker.name, spec.resource_type);
        Ok(Arc::clone(worker) as Arc<dyn Worker>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn spec(resource_type: &str, tags: &[&str]) -> WorkerSpec {
        WorkerSpec {
            resource_type: ResourceType::new(resource_type),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn worker(name: &str, tags: &[&str]) -> Arc<LocalWorker> {
        Arc::new(LocalWorker::new(
            name,
            tags.iter().map(|t| t.to_string()).collect(),
            [ResourceType::new("git"), ResourceType::new("s3")],
            None,
        ))
    }

    #[tokio::test]
    async fn selects_worker_with_type_and_tags() {
        let client = LocalWorkerClient::new(vec![worker("plain", &[]), worker("gpu", &["gpu"])]);

        let chosen = client.satisfying(&spec("git", &["gpu"])).await.unwrap();
        assert_eq!(chosen.name(), "gpu");

        let chosen = client.satisfying(&spec("s3", &[])).await.unwrap();
        assert_eq!(chosen.name(), "plain");
    }

    #[tokio::test]
    async fn no_worker_for_unknown_type() {
        let client = LocalWorkerClient::new(vec![worker("plain", &[])]);

        let err = client.satisfying(&spec("docker-image", &[])).await.err().unwrap();
        assert!(matches!(
            err,
            GantryError::NoCompatibleWorkers { ref resource_type, .. } if resource_type == "docker-image"
        ));
    }

    #[test]
    fn volume_manager_follows_store() {
        assert!(worker("plain", &[]).volume_manager().is_none());

        let dir = tempfile::TempDir::new().unwrap();
        let cached = LocalWorker::new(
            "cached",
            vec![],
            [ResourceType::new("git")],
            Some(LocalVolumeStore::new(
                dir.path().to_path_buf(),
                Arc::new(SystemClock),
            )),
        );
        assert!(cached.volume_manager().is_some());
    }
}
