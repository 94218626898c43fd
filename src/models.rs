//! Core data types for FFU Builder.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Target processor architecture of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    X64,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X64 => write!(f, "x64"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Logical sector size of the virtual disk the base image is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u32", into = "u32")]
pub enum SectorSize {
    #[default]
    B512,
    B4096,
}

impl SectorSize {
    pub fn bytes(&self) -> u32 {
        match self {
            SectorSize::B512 => 512,
            SectorSize::B4096 => 4096,
        }
    }
}

impl TryFrom<u32> for SectorSize {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            512 => Ok(SectorSize::B512),
            4096 => Ok(SectorSize::B4096),
            other => Err(format!("sector size must be 512 or 4096, got {}", other)),
        }
    }
}

impl From<SectorSize> for u32 {
    fn from(value: SectorSize) -> Self {
        value.bytes()
    }
}

/// How the final artifact is captured from the prepared base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Boot a throwaway VM from the base image, wait for it to power off, then capture
    #[default]
    Vm,
    /// Capture straight from the prepared base image
    Direct,
}

/// Update package category. Ordering is the order the platform requires
/// packages to be applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    ServicingStack,
    Cumulative,
    DotNet,
    Feature,
    Other,
}

impl UpdateKind {
    /// Infer the kind from a package file name.
    pub fn infer(file_name: &str) -> Self {
        let lower = file_name.to_lowercase();
        if lower.contains("ssu") || lower.contains("servicing") {
            UpdateKind::ServicingStack
        } else if lower.contains("ndp") || lower.contains("dotnet") || lower.contains("netfx") {
            UpdateKind::DotNet
        } else if lower.contains("feature") || lower.contains("enablement") {
            UpdateKind::Feature
        } else {
            UpdateKind::Cumulative
        }
    }
}

impl FromStr for UpdateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "servicing-stack" | "ssu" => Ok(UpdateKind::ServicingStack),
            "cumulative" | "cu" => Ok(UpdateKind::Cumulative),
            "dotnet" | "dot-net" => Ok(UpdateKind::DotNet),
            "feature" => Ok(UpdateKind::Feature),
            "other" => Ok(UpdateKind::Other),
            _ => Err(format!("Unknown update kind: {}", s)),
        }
    }
}

/// One update package applied to the base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatePackage {
    /// File name as it lands in the updates directory; part of the cache fingerprint
    pub file: String,
    pub kind: UpdateKind,
    /// Download source (URL) for the backend; None when the file is supplied locally
    pub source: Option<String>,
}

impl UpdatePackage {
    pub fn new(file: impl Into<String>) -> Self {
        let file = file.into();
        UpdatePackage {
            kind: UpdateKind::infer(&file),
            file,
            source: None,
        }
    }
}

impl<'de> Deserialize<'de> for UpdatePackage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accept either a bare file name or a full table
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Entry {
            Name(String),
            Full {
                file: String,
                kind: Option<UpdateKind>,
                source: Option<String>,
            },
        }

        Ok(match Entry::deserialize(deserializer)? {
            Entry::Name(file) => UpdatePackage::new(file),
            Entry::Full { file, kind, source } => UpdatePackage {
                kind: kind.unwrap_or_else(|| UpdateKind::infer(&file)),
                file,
                source,
            },
        })
    }
}

/// A downloadable driver or application payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Unique identifier (driver model, application name)
    pub id: String,
    /// Where the download backend fetches it from
    pub source: String,
}

/// Handle to a base image applied onto a target volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    /// Disk image file backing the volume
    pub image: PathBuf,
    /// Mount point or partition identifier reported by the provider
    pub mount: Option<String>,
}

impl PartitionHandle {
    pub fn for_image(image: impl Into<PathBuf>) -> Self {
        PartitionHandle {
            image: image.into(),
            mount: None,
        }
    }
}

/// Volumes created on a target device by the provisioning backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolumeSet {
    pub device_id: String,
    pub boot: Option<String>,
    pub deploy: String,
}

/// Parameters for the throwaway capture VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub disk: PathBuf,
    pub memory_mb: u64,
    pub processors: u32,
}

/// A VM created by the lifecycle provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub name: String,
}

/// The only VM states the pipeline reasons about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Off,
    Other(String),
}

impl PowerState {
    /// Parse a state word reported by a VM tool.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("running") {
            PowerState::Running
        } else if lower == "off" || lower.contains("poweroff") || lower.contains("stopped") {
            PowerState::Off
        } else {
            PowerState::Other(raw.trim().to_string())
        }
    }
}
