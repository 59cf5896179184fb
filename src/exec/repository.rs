//! Per-build registry of step outputs

use crate::error::{GantryError, GantryResult};
use crate::exec::artifact::ArtifactSource;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Logical name a step publishes its output under
pub type SourceName = String;

/// Artifact sources produced by the steps of one build
///
/// Each name is written once; a second registration under the same name is
/// a build-plan bug and fails. Lookups never block on other lookups.
#[derive(Default)]
pub struct SourceRepository {
    sources: RwLock<HashMap<SourceName, Arc<dyn ArtifactSource>>>,
}

impl SourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `source` under `name`
    pub fn register(&self, name: &str, source: Arc<dyn ArtifactSource>) -> GantryResult<()> {
        let mut sources = self.sources.write();
        if sources.contains_key(name) {
            return Err(GantryError::SourceAlreadyRegistered(name.to_string()));
        }
        sources.insert(name.to_string(), source);
        debug!("Registered source: {}", name);
        Ok(())
    }

    /// Look up the source published under `name`
    pub fn source_for(&self, name: &str) -> Option<Arc<dyn ArtifactSource>> {
        self.sources.read().get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<SourceName> {
        let mut names: Vec<SourceName> = self.sources.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}
