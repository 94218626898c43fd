//! Unified error type hierarchy for FFU Builder
//!
//! Provides structured error handling with ConfigError, CacheError,
//! CollaboratorError, TaskItemError and the terminal BuildError.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::StageId;

/// Configuration file parsing and validation errors.
///
/// Raised before any side effect of a run; never escapes config resolution
/// other than as `BuildError::Validation`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(String),

    #[error("Invalid override '{0}': expected section.key=value")]
    InvalidOverride(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Artifact cache errors.
///
/// A corrupt manifest is reported through `CorruptManifest` and skipped by the
/// lookup; only registering a new entry can surface a cache error to a stage.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Corrupt cache manifest {path}: {reason}")]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("Artifact not found for registration: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Failed to persist cache entry {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("IO error in artifact cache: {0}")]
    IoError(#[from] io::Error),
}

/// Failure reported by an external tool or service.
#[derive(Error, Debug, Clone)]
pub enum CollaboratorError {
    /// The tool could not be started at all
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// The tool ran and exited unsuccessfully
    #[error("'{program}' failed: {reason}")]
    ToolFailed { program: String, reason: String },

    /// A required tool is not installed
    #[error("Required tool not found on PATH: {0}")]
    ToolMissing(String),

    /// A download backend could not fetch the identifier
    #[error("Download of '{identifier}' failed: {reason}")]
    Download { identifier: String, reason: String },

    /// A device provisioning backend failed
    #[error("Device '{device}' failed: {reason}")]
    Device { device: String, reason: String },

    /// A bounded wait ran out
    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    /// The tool was terminated by a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for CollaboratorError {
    fn from(e: io::Error) -> Self {
        CollaboratorError::Io(e.to_string())
    }
}

/// One work item failed; recovered locally by the task engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskItemError {
    #[error("No handler registered for task type {0}")]
    NoHandler(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Cancelled before start")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<CollaboratorError> for TaskItemError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::Cancelled => TaskItemError::Cancelled,
            other => TaskItemError::Failed(other.to_string()),
        }
    }
}

/// Terminal error of a pipeline run. Always names the stage that failed.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("[{stage}] invalid configuration: {source}")]
    Validation {
        stage: StageId,
        #[source]
        source: ConfigError,
    },

    #[error("[{stage}] {source}")]
    Collaborator {
        stage: StageId,
        #[source]
        source: CollaboratorError,
    },

    #[error("[{stage}] {} work item(s) failed: {}", .failed.len(), .failed.join("; "))]
    Batch { stage: StageId, failed: Vec<String> },

    #[error("[{stage}] {source}")]
    Cache {
        stage: StageId,
        #[source]
        source: CacheError,
    },

    #[error("[{stage}] I/O error on {path}: {reason}")]
    Io {
        stage: StageId,
        path: PathBuf,
        reason: String,
    },

    #[error("[{stage}] build cancelled by user")]
    Cancelled { stage: StageId },

    /// A previous run's marker is still present; it must be swept first
    #[error("[{stage}] run marker {path} from an interrupted run is still present; run the sweep first")]
    StaleRun { stage: StageId, path: PathBuf },
}

impl BuildError {
    /// Stage that raised the error
    pub fn stage(&self) -> StageId {
        match self {
            BuildError::Validation { stage, .. }
            | BuildError::Collaborator { stage, .. }
            | BuildError::Batch { stage, .. }
            | BuildError::Cache { stage, .. }
            | BuildError::Io { stage, .. }
            | BuildError::Cancelled { stage }
            | BuildError::StaleRun { stage, .. } => *stage,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, BuildError::Cancelled { .. })
    }

    /// Process exit code: 0 success, 1 failure, 2 bad configuration, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Validation { .. } => 2,
            BuildError::Cancelled { .. } => 130,
            _ => 1,
        }
    }

    pub(crate) fn collaborator(stage: StageId, source: CollaboratorError) -> Self {
        match source {
            CollaboratorError::Cancelled => BuildError::Cancelled { stage },
            source => BuildError::Collaborator { stage, source },
        }
    }

    pub(crate) fn io(stage: StageId, path: impl Into<PathBuf>, e: io::Error) -> Self {
        BuildError::Io {
            stage,
            path: path.into(),
            reason: e.to_string(),
        }
    }
}

/// Result alias used across the pipeline.
pub type Result<T> = std::result::Result<T, BuildError>;
