//! Configuration module for image builds.
//!
//! `BuildConfiguration` is the immutable snapshot every other component derives
//! its identity from. It is resolved once at startup and never mutated during
//! a run.
//!
//! # Module Structure
//!
//! - `loader`: merges built-in defaults, a config file and command-line overrides
//! - `validator`: rejects unusable configurations before any side effect
//!
//! # Configuration Flow
//!
//! 1. `BuildConfiguration::default()` provides the baseline
//! 2. `loader::resolve` deep-merges the config file and `key=value` overrides
//! 3. `validator::validate` checks the merged result
//! 4. The orchestrator receives it behind an `Arc` and only ever reads it

pub mod loader;
pub mod validator;

use crate::models::{Architecture, CaptureMode, SectorSize, SourceEntry, UpdatePackage};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All resolved build parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfiguration {
    // Image identity
    pub edition: String,
    pub architecture: Architecture,
    pub release: u32,
    pub version: String,
    pub language: String,
    pub optional_features: Vec<String>,
    pub sector_size: SectorSize,

    // Base image source (user-supplied install media, never deleted)
    pub image_source: PathBuf,
    pub image_index: u32,

    pub capture: CaptureMode,
    pub output_name: String,
    /// Minimum free space on the workspace volume; 0 disables the check
    pub min_free_space_gb: u64,

    pub updates: UpdateSettings,
    pub drivers: Vec<SourceEntry>,
    pub apps: Vec<SourceEntry>,
    /// Target USB device identifiers for the distribute stage
    pub devices: Vec<String>,

    pub vm: VmSettings,
    pub paths: PathSettings,
    pub cache: CacheSettings,
    pub concurrency: ConcurrencySettings,
    pub cleanup: CleanupSettings,
    pub tools: ToolSettings,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        BuildConfiguration {
            edition: "Pro".to_string(),
            architecture: Architecture::X64,
            release: 11,
            version: "24H2".to_string(),
            language: "en-us".to_string(),
            optional_features: Vec::new(),
            sector_size: SectorSize::B512,
            image_source: PathBuf::new(),
            image_index: 1,
            capture: CaptureMode::Vm,
            output_name: "Win{release}_{version}_{edition}_{arch}_{date}.ffu".to_string(),
            min_free_space_gb: 0,
            updates: UpdateSettings::default(),
            drivers: Vec::new(),
            apps: Vec::new(),
            devices: Vec::new(),
            vm: VmSettings::default(),
            paths: PathSettings::default(),
            cache: CacheSettings::default(),
            concurrency: ConcurrencySettings::default(),
            cleanup: CleanupSettings::default(),
            tools: ToolSettings::default(),
        }
    }
}

impl BuildConfiguration {
    /// Render the final artifact file name from `output_name`.
    pub fn render_output_name(&self) -> String {
        self.output_name
            .replace("{edition}", &self.edition)
            .replace("{release}", &self.release.to_string())
            .replace("{version}", &self.version)
            .replace("{arch}", &self.architecture.to_string())
            .replace("{lang}", &self.language)
            .replace("{date}", &Local::now().format("%Y%m%d").to_string())
    }

    /// Update file names in configuration order.
    pub fn update_file_names(&self) -> Vec<String> {
        self.updates.packages.iter().map(|p| p.file.clone()).collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Fetch packages through the download backend; otherwise they must already
    /// exist in the updates directory
    pub download: bool,
    pub packages: Vec<UpdatePackage>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            download: true,
            packages: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub name: String,
    pub memory_mb: u64,
    pub processors: u32,
    pub poll_interval_secs: u64,
    /// None waits for power-off indefinitely
    pub power_off_timeout_secs: Option<u64>,
}

impl Default for VmSettings {
    fn default() -> Self {
        VmSettings {
            name: "ffu-capture".to_string(),
            memory_mb: 8192,
            processors: 4,
            poll_interval_secs: 5,
            power_off_timeout_secs: None,
        }
    }
}

/// Workspace layout. Every directory defaults to a child of `workspace`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub workspace: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub marker_file: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        PathSettings {
            workspace: PathBuf::from("."),
            cache_dir: None,
            output_dir: None,
            downloads_dir: None,
            scratch_dir: None,
            log_file: None,
            marker_file: None,
        }
    }
}

impl PathSettings {
    fn under(&self, explicit: &Option<PathBuf>, child: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.workspace.join(child))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.under(&self.cache_dir, "cache")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.under(&self.output_dir, "output")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.under(&self.downloads_dir, "downloads")
    }

    pub fn drivers_dir(&self) -> PathBuf {
        self.downloads_dir().join("drivers")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.downloads_dir().join("apps")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.downloads_dir().join("updates")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.under(&self.scratch_dir, "scratch")
    }

    pub fn log_file(&self) -> PathBuf {
        self.under(&self.log_file, "logs/progress.log")
    }

    pub fn marker_file(&self) -> PathBuf {
        self.under(&self.marker_file, ".run-marker")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Keep at most this many cache entries after each registration; None keeps all
    pub retain_latest: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            retain_latest: None,
        }
    }
}

/// Worker pool sizes. 0 means one worker per item.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub downloads: usize,
    pub devices: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        ConcurrencySettings {
            downloads: num_cpus::get().min(8),
            devices: 0,
        }
    }
}

/// Which artifacts a cancel or sweep is allowed to delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupScope {
    /// Only paths created by the current run
    #[default]
    CurrentRun,
    /// Also the scratch and download directories as a whole
    All,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub cancel_scope: CleanupScope,
    /// Remove downloaded drivers/apps/updates after a successful build
    pub remove_downloads: bool,
    /// Remove the scratch directory after a successful build
    pub remove_scratch: bool,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        CleanupSettings {
            cancel_scope: CleanupScope::CurrentRun,
            remove_downloads: false,
            remove_scratch: true,
        }
    }
}

/// Command line of one external tool. Arguments may contain `{placeholder}`s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        ToolCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Command templates for the command-based collaborators.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub apply_image: ToolCommand,
    pub add_package: ToolCommand,
    pub capture_image: ToolCommand,
    pub optimize_image: Option<ToolCommand>,
    pub vm_create: ToolCommand,
    pub vm_start: ToolCommand,
    pub vm_state: ToolCommand,
    pub vm_destroy: ToolCommand,
    pub author_media: ToolCommand,
    pub partition_device: ToolCommand,
    pub copy_to_device: ToolCommand,
}

impl Default for ToolSettings {
    fn default() -> Self {
        ToolSettings {
            apply_image: ToolCommand::new(
                "dism",
                &["/Apply-Image", "/ImageFile:{image}", "/Index:{index}", "/ApplyDir:{target}"],
            ),
            add_package: ToolCommand::new(
                "dism",
                &["/Image:{volume}", "/Add-Package", "/PackagePath:{package}"],
            ),
            capture_image: ToolCommand::new(
                "dism",
                &["/Capture-FFU", "/ImageFile:{destination}", "/CaptureDrive:{volume}", "/Name:{name}"],
            ),
            optimize_image: Some(ToolCommand::new(
                "dism",
                &["/Optimize-FFU", "/ImageFile:{artifact}"],
            )),
            vm_create: ToolCommand::new(
                "vmctl",
                &["create", "{name}", "--disk", "{disk}", "--memory", "{memory_mb}", "--cpus", "{processors}"],
            ),
            vm_start: ToolCommand::new("vmctl", &["start", "{name}"]),
            vm_state: ToolCommand::new("vmctl", &["state", "{name}"]),
            vm_destroy: ToolCommand::new("vmctl", &["destroy", "{name}"]),
            author_media: ToolCommand::new(
                "oscdimg",
                &["-m", "-o", "-u2", "{source}", "{destination}"],
            ),
            partition_device: ToolCommand::new("usbprep", &["partition", "{device}"]),
            copy_to_device: ToolCommand::new(
                "usbprep",
                &["copy", "{device}", "{deploy}", "{artifact}"],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_workspace() {
        let paths = PathSettings {
            workspace: PathBuf::from("/ws"),
            cache_dir: Some(PathBuf::from("/fast/cache")),
            ..Default::default()
        };
        assert_eq!(paths.cache_dir(), PathBuf::from("/fast/cache"));
        assert_eq!(paths.updates_dir(), PathBuf::from("/ws/downloads/updates"));
        assert_eq!(paths.marker_file(), PathBuf::from("/ws/.run-marker"));
        assert_eq!(paths.log_file(), PathBuf::from("/ws/logs/progress.log"));
    }

    #[test]
    fn test_render_output_name() {
        let config = BuildConfiguration {
            output_name: "Win{release}_{version}_{edition}_{arch}_{lang}.ffu".to_string(),
            ..Default::default()
        };
        assert_eq!(config.render_output_name(), "Win11_24H2_Pro_x64_en-us.ffu");
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let config: BuildConfiguration = toml::from_str(
            r#"
            edition = "Enterprise"
            no_such_option = true
            [vm]
            memory_mb = 4096
            flavour = "spicy"
            "#,
        )
        .unwrap();
        assert_eq!(config.edition, "Enterprise");
        assert_eq!(config.vm.memory_mb, 4096);
        assert_eq!(config.vm.processors, 4);
    }
}
