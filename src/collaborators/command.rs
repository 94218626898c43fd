//! Collaborators that drive configurable command-line tools.
//!
//! Each operation renders one `ToolCommand` template from `[tools]` and runs it
//! through the `ToolRunner`, so output streaming, PID tracking and cancellation
//! are handled in one place.

use super::{
    BaseImageProvider, CaptureProvider, Collaborators, DeviceProvisioner, Fetcher, MediaAuthor, Toolchain,
    UpdateApplier, VmProvider,
};
use crate::config::{BuildConfiguration, ToolCommand, ToolSettings};
use crate::error::CollaboratorError;
use crate::models::{CaptureMode, PartitionHandle, PowerState, VmHandle, VmSpec, VolumeSet};
use crate::system::{find_on_path, ToolRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct CommandCollaborators {
    runner: ToolRunner,
    tools: ToolSettings,
    /// Name recorded inside captured images
    image_name: String,
    /// Programs `verify` checks for
    required: Vec<String>,
}

impl CommandCollaborators {
    pub fn new(runner: ToolRunner, tools: ToolSettings, image_name: impl Into<String>) -> Self {
        let required = Self::programs(&tools, true, true, true);
        CommandCollaborators {
            runner,
            tools,
            image_name: image_name.into(),
            required,
        }
    }

    /// Only the tools `config` will actually run are required.
    pub fn from_config(config: &BuildConfiguration, runner: ToolRunner) -> Self {
        let mut collaborators = Self::new(
            runner,
            config.tools.clone(),
            format!("Windows {} {} {}", config.release, config.edition, config.version),
        );
        collaborators.required = Self::programs(
            &config.tools,
            config.capture == CaptureMode::Vm,
            !config.apps.is_empty(),
            !config.devices.is_empty(),
        );
        collaborators
    }

    fn programs(tools: &ToolSettings, vm: bool, media: bool, devices: bool) -> Vec<String> {
        let mut commands: Vec<&ToolCommand> = vec![&tools.apply_image, &tools.add_package, &tools.capture_image];
        if let Some(ref optimize) = tools.optimize_image {
            commands.push(optimize);
        }
        if vm {
            commands.extend([&tools.vm_create, &tools.vm_start, &tools.vm_state, &tools.vm_destroy]);
        }
        if media {
            commands.push(&tools.author_media);
        }
        if devices {
            commands.extend([&tools.partition_device, &tools.copy_to_device]);
        }

        let mut programs: Vec<String> = Vec::new();
        for command in commands {
            if !programs.contains(&command.program) {
                programs.push(command.program.clone());
            }
        }
        programs
    }

    /// Bundle these implementations with download backends.
    pub fn into_bundle(
        self,
        driver_fetcher: Arc<dyn Fetcher>,
        app_fetcher: Arc<dyn Fetcher>,
        update_fetcher: Arc<dyn Fetcher>,
    ) -> Collaborators {
        let this = Arc::new(self);
        Collaborators {
            base_image: this.clone(),
            updates: this.clone(),
            capture: this.clone(),
            vm: this.clone(),
            media: this.clone(),
            devices: this.clone(),
            toolchain: this,
            driver_fetcher,
            app_fetcher,
            update_fetcher,
        }
    }
}

fn path_var(name: &'static str, path: &Path) -> (&'static str, String) {
    (name, path.display().to_string())
}

fn volume_arg(volume: &PartitionHandle) -> String {
    volume
        .mount
        .clone()
        .unwrap_or_else(|| volume.image.display().to_string())
}

/// Build a `VolumeSet` from the partition tool's `key=value` output.
pub fn parse_volume_set(device_id: &str, lines: &[String]) -> Result<VolumeSet, CollaboratorError> {
    let mut boot = None;
    let mut deploy = None;
    for line in lines {
        if let Some((key, value)) = line.trim().split_once('=') {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "boot" => boot = Some(value.to_string()),
                "deploy" => deploy = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let deploy = deploy.ok_or_else(|| CollaboratorError::Device {
        device: device_id.to_string(),
        reason: "partition tool reported no deploy volume".to_string(),
    })?;
    Ok(VolumeSet {
        device_id: device_id.to_string(),
        boot,
        deploy,
    })
}

fn device_error(device_id: &str, e: CollaboratorError) -> CollaboratorError {
    match e {
        CollaboratorError::Cancelled => CollaboratorError::Cancelled,
        other => CollaboratorError::Device {
            device: device_id.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl BaseImageProvider for CommandCollaborators {
    async fn apply(&self, image_source: &Path, target_volume: &Path, index: u32) -> Result<PartitionHandle, CollaboratorError> {
        if let Some(parent) = target_volume.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.runner
            .run(
                &self.tools.apply_image,
                &[
                    path_var("image", image_source),
                    ("index", index.to_string()),
                    path_var("target", target_volume),
                ],
            )
            .await?;

        if !target_volume.exists() {
            return Err(CollaboratorError::ToolFailed {
                program: self.tools.apply_image.program.clone(),
                reason: format!("no image written to {}", target_volume.display()),
            });
        }
        Ok(PartitionHandle::for_image(target_volume))
    }
}

#[async_trait]
impl UpdateApplier for CommandCollaborators {
    async fn apply_package(&self, volume: &PartitionHandle, package: &Path) -> Result<(), CollaboratorError> {
        self.runner
            .run(
                &self.tools.add_package,
                &[("volume", volume_arg(volume)), path_var("package", package)],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CaptureProvider for CommandCollaborators {
    async fn capture(&self, volume: &PartitionHandle, destination: &Path) -> Result<PathBuf, CollaboratorError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.runner
            .run(
                &self.tools.capture_image,
                &[
                    path_var("destination", destination),
                    ("volume", volume_arg(volume)),
                    ("name", self.image_name.clone()),
                ],
            )
            .await?;

        if !destination.exists() {
            return Err(CollaboratorError::ToolFailed {
                program: self.tools.capture_image.program.clone(),
                reason: format!("no artifact written to {}", destination.display()),
            });
        }
        Ok(destination.to_path_buf())
    }

    async fn optimize(&self, artifact: &Path) -> Result<(), CollaboratorError> {
        if let Some(ref command) = self.tools.optimize_image {
            self.runner.run(command, &[path_var("artifact", artifact)]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VmProvider for CommandCollaborators {
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, CollaboratorError> {
        self.runner
            .run(
                &self.tools.vm_create,
                &[
                    ("name", spec.name.clone()),
                    path_var("disk", &spec.disk),
                    ("memory_mb", spec.memory_mb.to_string()),
                    ("processors", spec.processors.to_string()),
                ],
            )
            .await?;
        Ok(VmHandle { name: spec.name.clone() })
    }

    async fn start(&self, vm: &VmHandle) -> Result<(), CollaboratorError> {
        self.runner.run(&self.tools.vm_start, &[("name", vm.name.clone())]).await?;
        Ok(())
    }

    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState, CollaboratorError> {
        let output = self.runner.run(&self.tools.vm_state, &[("name", vm.name.clone())]).await?;
        let last = output
            .stdout
            .iter()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(String::as_str)
            .unwrap_or("");
        Ok(PowerState::parse(last))
    }

    /// Runs even after a cancel. The `vm_destroy` template must itself
    /// succeed for a VM that is already gone.
    async fn destroy(&self, name: &str) -> Result<(), CollaboratorError> {
        self.runner
            .detached()
            .run(&self.tools.vm_destroy, &[("name", name.to_string())])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MediaAuthor for CommandCollaborators {
    async fn author(&self, content_dir: &Path, destination: &Path) -> Result<PathBuf, CollaboratorError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.runner
            .run(
                &self.tools.author_media,
                &[path_var("source", content_dir), path_var("destination", destination)],
            )
            .await?;
        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl DeviceProvisioner for CommandCollaborators {
    async fn partition_and_format(&self, device_id: &str) -> Result<VolumeSet, CollaboratorError> {
        let output = self
            .runner
            .run(&self.tools.partition_device, &[("device", device_id.to_string())])
            .await
            .map_err(|e| device_error(device_id, e))?;
        parse_volume_set(device_id, &output.stdout)
    }

    async fn copy_artifact(&self, volumes: &VolumeSet, artifact: &Path) -> Result<(), CollaboratorError> {
        self.runner
            .run(
                &self.tools.copy_to_device,
                &[
                    ("device", volumes.device_id.clone()),
                    ("deploy", volumes.deploy.clone()),
                    path_var("artifact", artifact),
                ],
            )
            .await
            .map_err(|e| device_error(&volumes.device_id, e))?;
        Ok(())
    }
}

#[async_trait]
impl Toolchain for CommandCollaborators {
    async fn verify(&self) -> Result<(), CollaboratorError> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|program| find_on_path(program).is_none())
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            log::info!("[Tool] Toolchain verified: {}", self.required.join(", "));
            Ok(())
        } else {
            Err(CollaboratorError::ToolMissing(missing.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_collector::MemoryChannel;
    use crate::recovery::{cancel_pair, ProcessRegistry};

    fn runner() -> ToolRunner {
        let (_, cancel) = cancel_pair();
        ToolRunner::new(Arc::new(MemoryChannel::new()), ProcessRegistry::default(), cancel)
    }

    #[test]
    fn test_parse_volume_set() {
        let lines = vec![
            "Partitioning disk 2".to_string(),
            "boot=E:".to_string(),
            " deploy = F: ".to_string(),
        ];
        let volumes = parse_volume_set("disk2", &lines).unwrap();
        assert_eq!(volumes.boot.as_deref(), Some("E:"));
        assert_eq!(volumes.deploy, "F:");
    }

    #[test]
    fn test_parse_volume_set_requires_deploy() {
        let err = parse_volume_set("disk2", &["boot=E:".to_string()]).unwrap_err();
        assert!(matches!(err, CollaboratorError::Device { ref device, .. } if device == "disk2"));
    }

    #[test]
    fn test_required_programs_follow_config() {
        let direct = BuildConfiguration {
            capture: CaptureMode::Direct,
            ..Default::default()
        };
        let collaborators = CommandCollaborators::from_config(&direct, runner());
        assert_eq!(collaborators.required, vec!["dism".to_string()]);

        let vm = BuildConfiguration {
            devices: vec!["usb0".to_string()],
            ..Default::default()
        };
        let collaborators = CommandCollaborators::from_config(&vm, runner());
        assert_eq!(
            collaborators.required,
            vec!["dism".to_string(), "vmctl".to_string(), "usbprep".to_string()]
        );
    }

    #[tokio::test]
    async fn test_verify_reports_missing_tools() {
        let mut tools = ToolSettings::default();
        tools.apply_image = ToolCommand::new("no-such-imager-31c9", &[]);
        let collaborators = CommandCollaborators::new(runner(), tools, "img");
        let err = collaborators.verify().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::ToolMissing(ref list) if list.contains("no-such-imager-31c9")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_power_state_parses_last_line() {
        let tools = ToolSettings {
            vm_state: ToolCommand::new("sh", &["-c", "echo querying {name}; echo Off"]),
            ..Default::default()
        };
        let collaborators = CommandCollaborators::new(runner(), tools, "img");
        let state = collaborators
            .power_state(&VmHandle {
                name: "ffu-capture".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(state, PowerState::Off);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_partition_and_copy_through_templates() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("copies");
        let tools = ToolSettings {
            partition_device: ToolCommand::new("sh", &["-c", "echo boot=B-{device}; echo deploy=D-{device}"]),
            copy_to_device: ToolCommand::new(
                "sh",
                &["-c", &format!("echo {{deploy}} {{artifact}} >> {}", log.display())],
            ),
            ..Default::default()
        };
        let collaborators = CommandCollaborators::new(runner(), tools, "img");

        let volumes = collaborators.partition_and_format("usb1").await.unwrap();
        assert_eq!(volumes.deploy, "D-usb1");
        collaborators
            .copy_artifact(&volumes, Path::new("/out/a.ffu"))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "D-usb1 /out/a.ffu");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_without_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolSettings {
            capture_image: ToolCommand::new("true", &[]),
            ..Default::default()
        };
        let collaborators = CommandCollaborators::new(runner(), tools, "img");
        let err = collaborators
            .capture(&PartitionHandle::for_image(dir.path()), &dir.path().join("out.ffu"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ToolFailed { .. }));
    }
}
