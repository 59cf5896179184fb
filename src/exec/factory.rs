//! Step factories backed by a worker pool

use crate::clock::Clock;
use crate::exec::{GetPlan, GetStep, SourceRepository, Step, StepFactory};
use crate::resource::TrackerFactory;
use crate::worker::WorkerClient;
use std::sync::Arc;

/// Builds steps that run on workers from one pool
#[derive(Clone)]
pub struct WorkerFactory {
    worker_client: Arc<dyn WorkerClient>,
    tracker_factory: Arc<dyn TrackerFactory>,
    clock: Arc<dyn Clock>,
}

impl WorkerFactory {
    pub fn new(
        worker_client: Arc<dyn WorkerClient>,
        tracker_factory: Arc<dyn TrackerFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker_client,
            tracker_factory,
            clock,
        }
    }

    /// Factory for a get step fetching `plan`
    pub fn get(&self, plan: GetPlan) -> GetStepFactory {
        GetStepFactory {
            plan,
            pool: self.clone(),
        }
    }
}

/// A get plan waiting to be bound into a build
pub struct GetStepFactory {
    plan: GetPlan,
    pool: WorkerFactory,
}

impl GetStepFactory {
    /// Bind the plan, keeping the concrete step type
    pub fn build(&self, repository: Arc<SourceRepository>) -> Arc<GetStep> {
        Arc::new(GetStep::new(
            self.plan.clone(),
            Arc::clone(&self.pool.worker_client),
            Arc::clone(&self.pool.tracker_factory),
            Arc::clone(&self.pool.clock),
            repository,
        ))
    }
}

impl StepFactory for GetStepFactory {
    fn using(&self, _prev: Arc<dyn Step>, repository: Arc<SourceRepository>) -> Arc<dyn Step> {
        self.build(repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::exec::fakes::{
        FakeGetDelegate, FakeResource, FakeTracker, FakeTrackerFactory, FakeVersionedSource,
        FakeWorker, FakeWorkerClient,
    };
    use crate::exec::{GetDelegate, NoopStep, Process, ResourceConfig, Success};
    use crate::resource::{Params, ResourceType, SessionId, Source, Version};

    #[tokio::test]
    async fn get_step_from_factory_runs_and_registers() {
        let versioned = Arc::new(FakeVersionedSource::new(Version::new(), vec![]));
        let resource = Arc::new(FakeResource::new(versioned));
        let tracker = Arc::new(FakeTracker::with_resource(resource));
        let worker_client = Arc::new(FakeWorkerClient::with_worker(Arc::new(FakeWorker::new(
            "some-worker",
            None,
        ))));
        let tracker_factory = Arc::new(FakeTrackerFactory::new(tracker));
        let delegate = Arc::new(FakeGetDelegate::new());

        let factory = WorkerFactory::new(
            worker_client,
            tracker_factory.clone(),
            Arc::new(FakeClock::new()),
        );
        let plan = GetPlan {
            metadata: Default::default(),
            source_name: "repo".to_string(),
            session: SessionId::new("session"),
            delegate: delegate.clone() as Arc<dyn GetDelegate>,
            resource: ResourceConfig {
                name: "repo".to_string(),
                resource_type: ResourceType::new("git"),
                source: Source::new(),
            },
            params: Params::new(),
            tags: vec![],
            version: None,
        };

        let repository = Arc::new(SourceRepository::new());
        let step = factory
            .get(plan)
            .using(Arc::new(NoopStep), Arc::clone(&repository));

        Process::invoke(Arc::clone(&step)).wait().await.unwrap();

        assert_eq!(step.success(), Some(Success(true)));
        assert_eq!(repository.names(), vec!["repo"]);
        assert_eq!(tracker_factory.workers(), vec!["some-worker"]);
        assert_eq!(delegate.completed_calls().len(), 1);
        step.release().await;
    }
}
