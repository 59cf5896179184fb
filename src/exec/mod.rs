//! Step execution
//!
//! A build plan is turned into steps by a [`StepFactory`]; each step runs as a
//! cancellable [`Process`] and publishes what it produced into the build's
//! [`SourceRepository`] for later steps to consume.

pub mod artifact;
pub mod delegate;
pub mod destination;
pub mod factory;
pub mod get_step;
pub mod metadata;
pub mod process;
pub mod repository;

#[cfg(any(test, feature = "test-support"))]
pub mod fakes;

pub use artifact::{
    first_entry, read_all, ArtifactDestination, ArtifactSource, ByteStream, FileStream,
    MemoryStream, VersionedArtifact,
};
pub use delegate::{GetDelegate, Sink};
pub use destination::DirectoryDestination;
pub use factory::{GetStepFactory, WorkerFactory};
pub use get_step::{GetPlan, GetState, GetStep, ResourceConfig};
pub use metadata::StepMetadata;
pub use process::{signal_channel, Process, Ready, Runnable, Signal, SignalSender, Signals};
pub use repository::{SourceName, SourceRepository};

use crate::resource::{MetadataField, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Exit status reported to a delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a step succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Success(pub bool);

/// What a successful fetch produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

/// A unit of a build plan
///
/// Results are only meaningful once the step's process has exited; before
/// that, and after an infrastructure failure, they are `None`.
#[async_trait]
pub trait Step: Runnable {
    /// Release whatever the step holds; safe to call more than once
    async fn release(&self);

    /// Whether the step succeeded
    fn success(&self) -> Option<Success>;

    /// Version and metadata the step produced
    fn version_info(&self) -> Option<VersionInfo>;
}

/// Builds a step bound to its predecessor and the build's repository
pub trait StepFactory: Send + Sync {
    fn using(&self, prev: Arc<dyn Step>, repository: Arc<SourceRepository>) -> Arc<dyn Step>;
}

/// Step that does nothing; the predecessor of a plan's first step
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStep;

#[async_trait]
impl Runnable for NoopStep {
    async fn run(&self, _signals: Signals, mut ready: Ready) -> crate::error::GantryResult<()> {
        ready.fire();
        Ok(())
    }
}

#[async_trait]
impl Step for NoopStep {
    async fn release(&self) {}

    fn success(&self) -> Option<Success> {
        Some(Success(true))
    }

    fn version_info(&self) -> Option<VersionInfo> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_display() {
        assert_eq!(ExitStatus(3).to_string(), "3");
        assert!(ExitStatus::SUCCESS.is_success());
        assert!(!ExitStatus(1).is_success());
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo {
            version: [("ref".to_string(), "abc".to_string())].into_iter().collect(),
            metadata: vec![MetadataField::new("author", "someone")],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": {"ref": "abc"},
                "metadata": [{"name": "author", "value": "someone"}]
            })
        );
    }

    #[tokio::test]
    async fn noop_step_succeeds() {
        let step: Arc<dyn Step> = Arc::new(NoopStep);
        let process = Process::invoke(Arc::clone(&step));
        process.wait().await.unwrap();
        assert_eq!(step.success(), Some(Success(true)));
        step.release().await;
    }
}
