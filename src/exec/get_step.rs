//! Get step: fetch a resource version onto a worker
//!
//! ```text
//! Pending -> SelectingWorker -> ResolvingVolume -> AcquiringResource
//!         -> Fetching (-> Signaled) -> Finalizing -> Completed
//! ```
//!
//! Any state can end in `Failed`. A warm cache volume skips `Fetching`.

use crate::cache::{CachedVolume, ResourceIdentity, Volume, VolumeCache, VolumeMount};
use crate::clock::Clock;
use crate::error::{GantryError, GantryResult};
use crate::exec::{
    signal_channel, ExitStatus, GetDelegate, Ready, Runnable, Signals, SourceName,
    SourceRepository, Step, StepMetadata, Success, VersionInfo, VersionedArtifact,
};
use crate::resource::{
    IoConfig, Params, Resource, ResourceType, Session, SessionId, Source, TrackerFactory, Version,
    VersionedSource,
};
use crate::worker::{WorkerClient, WorkerSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CACHE_HIT_MESSAGE: &[u8] = b"using version of resource found in cache\n";

/// A named resource as configured in the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub name: String,
    pub resource_type: ResourceType,
    pub source: Source,
}

/// Everything needed to build one get step
#[derive(Clone)]
pub struct GetPlan {
    pub metadata: StepMetadata,
    /// Name the fetched artifact is published under
    pub source_name: SourceName,
    pub session: SessionId,
    pub delegate: Arc<dyn GetDelegate>,
    pub resource: ResourceConfig,
    pub params: Params,
    /// Placement tags the worker must carry
    pub tags: Vec<String>,
    /// Version to fetch; latest when absent
    pub version: Option<Version>,
}

impl GetPlan {
    /// Identity the cache fingerprint is derived from
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(
            self.resource.resource_type.clone(),
            self.version.clone(),
            self.resource.source.clone(),
            self.params.clone(),
        )
    }
}

/// Where a get step is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    Pending,
    SelectingWorker,
    ResolvingVolume,
    AcquiringResource,
    Fetching,
    /// A signal was forwarded to the in-flight fetch
    Signaled,
    Finalizing,
    Completed,
    Failed,
}

impl fmt::Display for GetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::SelectingWorker => "selecting worker",
            Self::ResolvingVolume => "resolving volume",
            Self::AcquiringResource => "acquiring resource",
            Self::Fetching => "fetching",
            Self::Signaled => "signaled",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Held {
    resource: Option<Arc<dyn Resource>>,
    volume: Option<Arc<dyn Volume>>,
}

#[derive(Clone)]
struct Outcome {
    success: Success,
    version_info: Option<VersionInfo>,
}

struct Fetched {
    status: ExitStatus,
    info: Option<VersionInfo>,
    source: Arc<dyn VersionedSource>,
}

/// Step fetching one resource version
pub struct GetStep {
    plan: GetPlan,
    worker_client: Arc<dyn WorkerClient>,
    tracker_factory: Arc<dyn TrackerFactory>,
    clock: Arc<dyn Clock>,
    repository: Arc<SourceRepository>,
    state: Mutex<GetState>,
    held: Mutex<Held>,
    outcome: Mutex<Option<Outcome>>,
}

impl GetStep {
    pub fn new(
        plan: GetPlan,
        worker_client: Arc<dyn WorkerClient>,
        tracker_factory: Arc<dyn TrackerFactory>,
        clock: Arc<dyn Clock>,
        repository: Arc<SourceRepository>,
    ) -> Self {
        Self {
            plan,
            worker_client,
            tracker_factory,
            clock,
            repository,
            state: Mutex::new(GetState::Pending),
            held: Mutex::new(Held::default()),
            outcome: Mutex::new(None),
        }
    }

    pub fn state(&self) -> GetState {
        *self.state.lock()
    }

    pub fn plan(&self) -> &GetPlan {
        &self.plan
    }

    fn transition(&self, next: GetState) {
        let mut state = self.state.lock();
        debug!(
            "Get {} ({}): {} -> {}",
            self.plan.source_name, self.plan.resource.resource_type, *state, next
        );
        *state = next;
    }

    fn fail(&self, err: GantryError) -> GantryResult<()> {
        warn!("Get {} failed: {}", self.plan.source_name, err);
        self.transition(GetState::Failed);
        self.plan.delegate.failed(&err);
        Err(err)
    }

    async fn execute(&self, signals: &mut Signals, ready: &mut Ready) -> GantryResult<Fetched> {
        let resource_type = &self.plan.resource.resource_type;

        self.transition(GetState::SelectingWorker);
        let worker = self
            .worker_client
            .satisfying(&WorkerSpec {
                resource_type: resource_type.clone(),
                tags: self.plan.tags.clone(),
            })
            .await?;

        self.transition(GetState::ResolvingVolume);
        let cache = match worker.volume_manager() {
            Some(store) => {
                let fingerprint = self.plan.identity().fingerprint()?;
                let cache = VolumeCache::new(store, Arc::clone(&self.clock));
                let cached = cache.resolve(&fingerprint).await?;
                self.held.lock().volume = Some(Arc::clone(&cached.volume));
                Some((cache, cached))
            }
            None => {
                debug!("Worker {} has no volume manager, fetching without a cache", worker.name());
                None
            }
        };

        self.transition(GetState::AcquiringResource);
        let mount = cache
            .as_ref()
            .map(|(_, cached)| VolumeMount::for_get(Arc::clone(&cached.volume)));
        let session = Session {
            id: self.plan.session.clone(),
            ephemeral: false,
        };
        let resource = self
            .tracker_factory
            .tracker_for(worker)
            .init(&self.plan.metadata, session, resource_type, &self.plan.tags, mount)
            .await?;
        self.held.lock().resource = Some(Arc::clone(&resource));

        let delegate = &self.plan.delegate;
        let versioned = resource.get(
            IoConfig {
                stdout: delegate.stdout(),
                stderr: delegate.stderr(),
            },
            &self.plan.resource.source,
            &self.plan.params,
            self.plan.version.as_ref(),
        );

        let warm = cache
            .as_ref()
            .is_some_and(|(_, cached)| cached.state.is_warm());

        if warm {
            if let Err(e) = delegate.stdout().write_all(CACHE_HIT_MESSAGE) {
                warn!("Failed to write to delegate stdout: {}", e);
            }
            ready.fire();
            self.transition(GetState::Finalizing);
        } else {
            self.transition(GetState::Fetching);
            if let Err(err) = self.fetch(&versioned, signals, ready).await {
                return match err.script_exit_status() {
                    Some(status) => {
                        info!(
                            "Resource script for {} exited with status {}",
                            self.plan.source_name, status
                        );
                        self.transition(GetState::Finalizing);
                        Ok(Fetched {
                            status: ExitStatus(status),
                            info: None,
                            source: versioned,
                        })
                    }
                    None => Err(err),
                };
            }

            self.transition(GetState::Finalizing);
            if let Some((cache, cached)) = &cache {
                self.finalize_volume(cache, cached, resource.as_ref()).await?;
            }
        }

        Ok(Fetched {
            status: ExitStatus::SUCCESS,
            info: Some(VersionInfo {
                version: versioned.version(),
                metadata: versioned.metadata(),
            }),
            source: versioned,
        })
    }

    /// Run the fetch, forwarding signals until it returns
    async fn fetch(
        &self,
        versioned: &Arc<dyn VersionedSource>,
        signals: &mut Signals,
        ready: &mut Ready,
    ) -> GantryResult<()> {
        let (forward, fetch_signals) = signal_channel();
        let (fetch_ready, mut fetch_ready_rx) = Ready::channel();
        let mut fetch = versioned.run(fetch_signals, fetch_ready);

        let mut awaiting_ready = true;
        let mut signals_open = true;

        loop {
            tokio::select! {
                result = &mut fetch => {
                    if awaiting_ready && fetch_ready_rx.try_recv().is_ok() {
                        ready.fire();
                    }
                    return result;
                }
                fired = &mut fetch_ready_rx, if awaiting_ready => {
                    awaiting_ready = false;
                    if fired.is_ok() {
                        debug!("Fetch for {} is ready", self.plan.source_name);
                        ready.fire();
                    }
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => {
                        info!("Forwarding {} to fetch for {}", signal, self.plan.source_name);
                        self.transition(GetState::Signaled);
                        if forward.send(signal).is_err() {
                            debug!("Fetch stopped listening for signals");
                        }
                    }
                    None => signals_open = false,
                },
            }
        }
    }

    /// Mark a freshly created volume warm if the fetch wrote into it
    async fn finalize_volume(
        &self,
        cache: &VolumeCache,
        cached: &CachedVolume,
        resource: &dyn Resource,
    ) -> GantryResult<()> {
        let handle = cached.volume.handle();
        let touched = resource.volume_handles().await?;

        if touched.iter().any(|h| h == handle) {
            cache.mark_initialized(handle).await
        } else {
            debug!("Fetch did not touch volume {}, leaving it uninitialized", handle);
            Ok(())
        }
    }
}

#[async_trait]
impl Runnable for GetStep {
    async fn run(&self, mut signals: Signals, mut ready: Ready) -> GantryResult<()> {
        let fetched = match self.execute(&mut signals, &mut ready).await {
            Ok(fetched) => fetched,
            Err(err) => return self.fail(err),
        };

        let artifact = Arc::new(VersionedArtifact::new(fetched.source));
        if let Err(err) = self.repository.register(&self.plan.source_name, artifact) {
            return self.fail(err);
        }

        *self.outcome.lock() = Some(Outcome {
            success: Success(fetched.status.is_success()),
            version_info: fetched.info.clone(),
        });
        self.transition(GetState::Completed);
        self.plan
            .delegate
            .completed(fetched.status, fetched.info.as_ref());
        Ok(())
    }
}

#[async_trait]
impl Step for GetStep {
    async fn release(&self) {
        let (resource, volume) = {
            let mut held = self.held.lock();
            (held.resource.take(), held.volume.take())
        };

        if let Some(resource) = resource {
            debug!("Releasing resource for {}", self.plan.source_name);
            resource.release().await;
        }
        if let Some(volume) = volume {
            debug!("Releasing volume {}", volume.handle());
            volume.release();
        }
    }

    fn success(&self) -> Option<Success> {
        self.outcome.lock().as_ref().map(|o| o.success)
    }

    fn version_info(&self) -> Option<VersionInfo> {
        self.outcome.lock().as_ref().and_then(|o| o.version_info.clone())
    }
}

#[cfg(test)]
#[path = "get_step_tests.rs"]
mod tests;
