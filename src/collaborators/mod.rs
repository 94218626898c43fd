//! External collaborators: the narrow call contracts the pipeline uses to
//! reach imaging, VM, media, download and device tools.
//!
//! The orchestrator only ever sees these traits. `command` provides
//! implementations that drive configurable command-line tools and `http`
//! provides a download backend.

pub mod command;
pub mod http;

use crate::error::CollaboratorError;
use crate::models::{PartitionHandle, PowerState, VmHandle, VmSpec, VolumeSet};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use command::CommandCollaborators;
pub use http::HttpFetcher;

/// Applies a base OS image onto a target volume.
#[async_trait]
pub trait BaseImageProvider: Send + Sync {
    async fn apply(
        &self,
        image_source: &Path,
        target_volume: &Path,
        index: u32,
    ) -> Result<PartitionHandle, CollaboratorError>;
}

/// Services an applied image with one update package.
#[async_trait]
pub trait UpdateApplier: Send + Sync {
    async fn apply_package(&self, volume: &PartitionHandle, package: &Path) -> Result<(), CollaboratorError>;
}

/// Captures the deployable artifact from a prepared volume.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn capture(&self, volume: &PartitionHandle, destination: &Path) -> Result<PathBuf, CollaboratorError>;

    /// Post-capture optimisation; a no-op unless the provider supports one
    async fn optimize(&self, _artifact: &Path) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Throwaway VM lifecycle. Nothing beyond "running" / "off" is assumed.
#[async_trait]
pub trait VmProvider: Send + Sync {
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, CollaboratorError>;
    async fn start(&self, vm: &VmHandle) -> Result<(), CollaboratorError>;
    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState, CollaboratorError>;
    /// Must succeed for a VM that no longer exists
    async fn destroy(&self, name: &str) -> Result<(), CollaboratorError>;
}

/// A download backend (drivers, applications, updates).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, identifier: &str, destination_dir: &Path) -> Result<PathBuf, CollaboratorError>;
}

/// USB device preparation.
#[async_trait]
pub trait DeviceProvisioner: Send + Sync {
    async fn partition_and_format(&self, device_id: &str) -> Result<VolumeSet, CollaboratorError>;
    async fn copy_artifact(&self, volumes: &VolumeSet, artifact: &Path) -> Result<(), CollaboratorError>;
}

/// Bootable/side media authoring.
#[async_trait]
pub trait MediaAuthor: Send + Sync {
    async fn author(&self, content_dir: &Path, destination: &Path) -> Result<PathBuf, CollaboratorError>;
}

/// Checks that the external tools the run needs are available.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn verify(&self) -> Result<(), CollaboratorError>;
}

/// Everything the orchestrator calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub base_image: Arc<dyn BaseImageProvider>,
    pub updates: Arc<dyn UpdateApplier>,
    pub capture: Arc<dyn CaptureProvider>,
    pub vm: Arc<dyn VmProvider>,
    pub media: Arc<dyn MediaAuthor>,
    pub devices: Arc<dyn DeviceProvisioner>,
    pub toolchain: Arc<dyn Toolchain>,
    pub driver_fetcher: Arc<dyn Fetcher>,
    pub app_fetcher: Arc<dyn Fetcher>,
    pub update_fetcher: Arc<dyn Fetcher>,
}
