//! FFU Builder core.
//!
//! Builds a deployable OS image from install media through a fixed pipeline:
//! acquire drivers and applications, apply the base image (or reuse a cached
//! one), service it with updates, capture it (optionally via a throwaway VM),
//! then optionally provision USB devices with the result.
//!
//! The system is organized into functional modules:
//! - **error**: error hierarchy and exit-code mapping
//! - **models**: shared value types (handles, enums, package descriptors)
//! - **config**: resolved build configuration (defaults, file, overrides)
//! - **log_collector**: the progress/log channel and its file tail
//! - **tasks**: bounded worker pool for batches of independent work items
//! - **cache**: fingerprinted base-image store
//! - **collaborators**: traits for the external tools plus the command/HTTP backends
//! - **recovery**: cancellation token, process registry, run marker and stale-run sweep
//! - **orchestrator**: the stage pipeline with cache short-circuit and unwind
//! - **system**: tool runner and host queries

pub mod error;
pub mod models;

pub mod config;

pub mod log_collector;

pub mod tasks;

pub mod cache;

pub mod collaborators;

pub mod recovery;

pub mod orchestrator;

pub mod system;

// Re-export the log crate for macro usage
pub use log;

pub use error::{BuildError, CacheError, CollaboratorError, ConfigError, Result, TaskItemError};

pub use config::BuildConfiguration;

pub use log_collector::{LogCollector, MemoryChannel, ProgressChannel, ProgressEvent};

pub use cache::{ArtifactCache, CacheFingerprint, CacheManifest, RetentionPolicy};

pub use collaborators::Collaborators;

pub use recovery::{cancel_pair, CancelSignal, CancelTrigger, ProcessRegistry, RecoveryController, RunMarker};

pub use orchestrator::{Orchestrator, RunState, StageId, StageOutcome};

pub use tasks::{BatchPolicy, TaskEngine, WorkItem, WorkStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_error_reexport() {
        let _: Result<i32> = Ok(42);
    }
}
