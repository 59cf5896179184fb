//! Error types for Gantry
//!
//! All modules use `GantryResult<T>` as their return type. Collaborator
//! traits return `GantryError` directly, so an error produced by a worker,
//! volume store or resource reaches the caller unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Gantry operations
pub type GantryResult<T> = Result<T, GantryError>;

/// All errors that can occur in Gantry
///
/// The type is `Clone` so a step's terminal error can be handed to every
/// waiter of its process; sources that are not `Clone` are held in an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum GantryError {
    // Worker errors
    #[error("no workers satisfy resource type {resource_type:?} with tags {tags:?}")]
    NoCompatibleWorkers {
        resource_type: String,
        tags: Vec<String>,
    },

    #[error("worker error: {0}")]
    Worker(String),

    // Resource errors
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("resource script failed with exit status {exit_status}")]
    ResourceScriptFailed { exit_status: i32 },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("invalid resource script output: {0}")]
    ResourceOutput(String),

    // Volume errors
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume error: {0}")]
    Volume(String),

    // Artifact errors
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("source already registered: {0}")]
    SourceAlreadyRegistered(String),

    #[error("stream error: {0}")]
    Stream(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[source] Arc<serde_json::Error>),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl GantryError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source: Arc::new(source),
        }
    }

    /// Exit status carried by a resource script failure
    ///
    /// This is the one error category a get step reports as a completion
    /// rather than a failure.
    pub fn script_exit_status(&self) -> Option<i32> {
        match self {
            Self::ResourceScriptFailed { exit_status } => Some(*exit_status),
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoCompatibleWorkers { .. } => {
                Some("Check [worker] tags and [resource_types] in the config")
            }
            Self::UnknownResourceType(_) => {
                Some("Add the type under [resource_types] in the config")
            }
            Self::ConfigInvalid { .. } => Some("Run: gantry config init --force"),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GantryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<toml::ser::Error> for GantryError {
    fn from(err: toml::ser::Error) -> Self {
        Self::TomlSerialize(err.to_string())
    }
}
