//! Handlers that bridge work items to the external collaborators.

use super::{TaskArguments, TaskHandler, TaskPayload};
use crate::collaborators::{DeviceProvisioner, Fetcher};
use crate::error::TaskItemError;
use async_trait::async_trait;
use std::sync::Arc;

/// Runs `Fetch` items against a download backend.
pub struct FetchHandler {
    fetcher: Arc<dyn Fetcher>,
}

impl FetchHandler {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        FetchHandler { fetcher }
    }
}

#[async_trait]
impl TaskHandler for FetchHandler {
    async fn handle(&self, arguments: &TaskArguments) -> Result<TaskPayload, TaskItemError> {
        let TaskArguments::Fetch { identifier, destination } = arguments else {
            return Err(TaskItemError::Failed(
                "fetch handler received non-fetch arguments".to_string(),
            ));
        };

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| TaskItemError::Failed(format!("{}: {}", destination.display(), e)))?;

        let path = self.fetcher.fetch(identifier, destination).await?;
        Ok(TaskPayload::Fetched(path))
    }
}

/// Partitions one device and copies the artifact onto it.
pub struct ProvisionHandler {
    provisioner: Arc<dyn DeviceProvisioner>,
}

impl ProvisionHandler {
    pub fn new(provisioner: Arc<dyn DeviceProvisioner>) -> Self {
        ProvisionHandler { provisioner }
    }
}

#[async_trait]
impl TaskHandler for ProvisionHandler {
    async fn handle(&self, arguments: &TaskArguments) -> Result<TaskPayload, TaskItemError> {
        let TaskArguments::Provision { device_id, artifact } = arguments else {
            return Err(TaskItemError::Failed(
                "provision handler received non-provision arguments".to_string(),
            ));
        };

        let volumes = self.provisioner.partition_and_format(device_id).await?;
        self.provisioner.copy_artifact(&volumes, artifact).await?;
        Ok(TaskPayload::Provisioned(volumes))
    }
}
