//! Shared fakes for the integration tests.
//!
//! `FakeTools` implements every collaborator trait and records each call as a
//! short string ("apply", "update:KB1.msu", "destroy:ffu-capture", ...), so a
//! test can assert on what ran and in which order.

#![allow(dead_code)]

use async_trait::async_trait;
use ffu_builder::collaborators::{
    BaseImageProvider, CaptureProvider, Collaborators, DeviceProvisioner, Fetcher, MediaAuthor, Toolchain,
    UpdateApplier, VmProvider,
};
use ffu_builder::config::BuildConfiguration;
use ffu_builder::models::{
    CaptureMode, PartitionHandle, PowerState, SourceEntry, UpdateKind, UpdatePackage, VmHandle, VmSpec, VolumeSet,
};
use ffu_builder::CollaboratorError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeTools {
    calls: Mutex<Vec<String>>,
    /// Calls (exact name) that fail with ToolFailed
    failing: Mutex<Vec<String>>,
    /// power_state reports Running this many times before Off; None never powers off
    polls_until_off: Mutex<Option<usize>>,
    polls: AtomicUsize,
    missing_tool: Mutex<Option<String>>,
}

impl FakeTools {
    pub fn new() -> Arc<Self> {
        let tools = FakeTools::default();
        *tools.polls_until_off.lock().unwrap() = Some(0);
        Arc::new(tools)
    }

    pub fn fail_on(&self, call: &str) {
        self.failing.lock().unwrap().push(call.to_string());
    }

    pub fn never_power_off(&self) {
        *self.polls_until_off.lock().unwrap() = None;
    }

    pub fn power_off_after(&self, polls: usize) {
        *self.polls_until_off.lock().unwrap() = Some(polls);
    }

    pub fn missing_tool(&self, program: &str) {
        *self.missing_tool.lock().unwrap() = Some(program.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn has_call(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    fn record(&self, call: String) -> Result<(), CollaboratorError> {
        let fail = self.failing.lock().unwrap().contains(&call);
        self.calls.lock().unwrap().push(call.clone());
        if fail {
            return Err(CollaboratorError::ToolFailed {
                program: call,
                reason: "exit code 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn bundle(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            base_image: self.clone(),
            updates: self.clone(),
            capture: self.clone(),
            vm: self.clone(),
            media: self.clone(),
            devices: self.clone(),
            toolchain: self.clone(),
            driver_fetcher: self.clone(),
            app_fetcher: self.clone(),
            update_fetcher: self.clone(),
        }
    }
}

fn write(path: &Path, body: &str) -> Result<(), CollaboratorError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CollaboratorError::Io(e.to_string()))?;
    }
    std::fs::write(path, body).map_err(|e| CollaboratorError::Io(e.to_string()))
}

#[async_trait]
impl BaseImageProvider for FakeTools {
    async fn apply(&self, _source: &Path, target: &Path, _index: u32) -> Result<PartitionHandle, CollaboratorError> {
        self.record("apply".to_string())?;
        write(target, "base image")?;
        Ok(PartitionHandle::for_image(target))
    }
}

#[async_trait]
impl UpdateApplier for FakeTools {
    async fn apply_package(&self, _volume: &PartitionHandle, package: &Path) -> Result<(), CollaboratorError> {
        let name = package.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        self.record(format!("update:{}", name))
    }
}

#[async_trait]
impl CaptureProvider for FakeTools {
    async fn capture(&self, _volume: &PartitionHandle, destination: &Path) -> Result<PathBuf, CollaboratorError> {
        self.record("capture".to_string())?;
        write(destination, "captured image")?;
        Ok(destination.to_path_buf())
    }

    async fn optimize(&self, _artifact: &Path) -> Result<(), CollaboratorError> {
        self.record("optimize".to_string())
    }
}

#[async_trait]
impl VmProvider for FakeTools {
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, CollaboratorError> {
        self.record(format!("create:{}", spec.name))?;
        Ok(VmHandle { name: spec.name.clone() })
    }

    async fn start(&self, vm: &VmHandle) -> Result<(), CollaboratorError> {
        self.record(format!("start:{}", vm.name))
    }

    async fn power_state(&self, _vm: &VmHandle) -> Result<PowerState, CollaboratorError> {
        self.record("power_state".to_string())?;
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        match *self.polls_until_off.lock().unwrap() {
            Some(limit) if seen >= limit => Ok(PowerState::Off),
            _ => Ok(PowerState::Running),
        }
    }

    async fn destroy(&self, name: &str) -> Result<(), CollaboratorError> {
        self.record(format!("destroy:{}", name))
    }
}

#[async_trait]
impl Fetcher for FakeTools {
    async fn fetch(&self, identifier: &str, destination_dir: &Path) -> Result<PathBuf, CollaboratorError> {
        self.record(format!("fetch:{}", identifier))?;
        let path = destination_dir.join(identifier);
        write(&path, identifier)?;
        Ok(path)
    }
}

#[async_trait]
impl DeviceProvisioner for FakeTools {
    async fn partition_and_format(&self, device_id: &str) -> Result<VolumeSet, CollaboratorError> {
        self.record(format!("partition:{}", device_id))
            .map_err(|e| CollaboratorError::Device {
                device: device_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(VolumeSet {
            device_id: device_id.to_string(),
            boot: Some(format!("{}-boot", device_id)),
            deploy: format!("{}-deploy", device_id),
        })
    }

    async fn copy_artifact(&self, volumes: &VolumeSet, _artifact: &Path) -> Result<(), CollaboratorError> {
        self.record(format!("copy:{}", volumes.device_id))
    }
}

#[async_trait]
impl MediaAuthor for FakeTools {
    async fn author(&self, _content_dir: &Path, destination: &Path) -> Result<PathBuf, CollaboratorError> {
        self.record("author".to_string())?;
        write(destination, "media")?;
        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl Toolchain for FakeTools {
    async fn verify(&self) -> Result<(), CollaboratorError> {
        self.record("verify".to_string())?;
        match self.missing_tool.lock().unwrap().clone() {
            Some(program) => Err(CollaboratorError::ToolMissing(program)),
            None => Ok(()),
        }
    }
}

pub fn update(file: &str) -> UpdatePackage {
    UpdatePackage {
        file: file.to_string(),
        kind: UpdateKind::infer(file),
        source: Some(format!("https://updates.test/{}", file)),
    }
}

/// Direct-capture configuration rooted at `workspace` with two drivers and
/// two updates, listed cumulative before servicing stack.
pub fn test_config(workspace: &Path) -> BuildConfiguration {
    let image_source = workspace.join("install.wim");
    std::fs::write(&image_source, "install media").unwrap();

    let mut config = BuildConfiguration::default();
    config.image_source = image_source;
    config.capture = CaptureMode::Direct;
    config.output_name = "Win{release}_{edition}.ffu".to_string();
    config.paths.workspace = workspace.to_path_buf();
    config.drivers = vec![
        SourceEntry {
            id: "surface-pro".to_string(),
            source: "https://drivers.test/surface-pro.zip".to_string(),
        },
        SourceEntry {
            id: "latitude".to_string(),
            source: "https://drivers.test/latitude.zip".to_string(),
        },
    ];
    config.updates.packages = vec![update("windows11-kb5040000-cu.msu"), update("windows11-kb5039000-ssu.msu")];
    config.concurrency.downloads = 2;
    config.vm.poll_interval_secs = 1;
    config
}
