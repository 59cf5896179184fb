//! Resource fingerprints for content-addressed volume caching
//!
//! A fingerprint is the canonical property set of a resource configuration.
//! Same type, version, source and params = same cache volume, regardless of
//! the order the configuration maps were built in.

use crate::cache::volume::{properties, VolumeProperties};
use crate::error::GantryResult;
use crate::resource::{Params, ResourceType, Source, Version};
use sha2::{Digest, Sha256};
use std::fmt;

/// Everything that determines what a get step fetches
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceIdentity {
    pub resource_type: ResourceType,
    pub version: Option<Version>,
    pub source: Source,
    pub params: Params,
}

impl ResourceIdentity {
    pub fn new(
        resource_type: ResourceType,
        version: Option<Version>,
        source: Source,
        params: Params,
    ) -> Self {
        Self {
            resource_type,
            version,
            source,
            params,
        }
    }

    /// Derive the cache fingerprint
    ///
    /// Maps are key-sorted, so their JSON is canonical. An absent version
    /// serializes as `null`.
    pub fn fingerprint(&self) -> GantryResult<Fingerprint> {
        Ok(Fingerprint {
            resource_type: self.resource_type.to_string(),
            version: serde_json::to_string(&self.version)?,
            source: serde_json::to_string(&self.source)?,
            params: serde_json::to_string(&self.params)?,
        })
    }
}

/// Canonical property set identifying a cache volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub resource_type: String,
    pub version: String,
    pub source: String,
    pub params: String,
}

impl Fingerprint {
    /// Properties a fresh volume is created with (no `initialized` marker)
    pub fn properties(&self) -> VolumeProperties {
        let mut props = VolumeProperties::new();
        props.insert(
            properties::RESOURCE_TYPE.to_string(),
            self.resource_type.clone(),
        );
        props.insert(properties::RESOURCE_VERSION.to_string(), self.version.clone());
        props.insert(properties::RESOURCE_SOURCE.to_string(), self.source.clone());
        props.insert(properties::RESOURCE_PARAMS.to_string(), self.params.clone());
        props
    }

    /// Properties of a volume whose fetch completed
    pub fn initialized_properties(&self) -> VolumeProperties {
        let mut props = self.properties();
        props.insert(
            properties::INITIALIZED.to_string(),
            properties::INITIALIZED_VALUE.to_string(),
        );
        props
    }

    /// Recover a fingerprint from a volume's properties, ignoring the marker
    pub fn from_properties(props: &VolumeProperties) -> Option<Self> {
        Some(Self {
            resource_type: props.get(properties::RESOURCE_TYPE)?.clone(),
            version: props.get(properties::RESOURCE_VERSION)?.clone(),
            source: props.get(properties::RESOURCE_SOURCE)?.clone(),
            params: props.get(properties::RESOURCE_PARAMS)?.clone(),
        })
    }

    /// SHA256 of the canonical properties, first 12 hex chars
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.properties() {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        let result = hasher.finalize();
        hex::encode(&result[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource_type, self.digest())
    }
}
