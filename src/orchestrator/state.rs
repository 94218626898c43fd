//! Stage identifiers and per-run mutable state.
//!
//! **Architecture**:
//! - `StageId`: the fixed, totally ordered stage sequence with progress anchors
//! - `RunState`: everything a run accumulates (paths, handles, flags) and the
//!   bookkeeping the unwind path needs
//!
//! The configuration is never stored here; stages read it from the
//! orchestrator and write only into `RunState`.

use crate::cache::CacheManifest;
use crate::models::{PartitionHandle, VmHandle};
use crate::tasks::WorkItem;
use std::fmt;
use std::path::{Path, PathBuf};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    ValidateEnvironment,
    AcquireDrivers,
    ValidateToolchain,
    PrepareSideArtifacts,
    ResolveBaseImage,
    ApplyUpdates,
    FinalizeBaseImage,
    ProvisionAndCapture,
    PostProcess,
    Distribute,
    Cleanup,
}

impl StageId {
    pub const ALL: [StageId; 11] = [
        StageId::ValidateEnvironment,
        StageId::AcquireDrivers,
        StageId::ValidateToolchain,
        StageId::PrepareSideArtifacts,
        StageId::ResolveBaseImage,
        StageId::ApplyUpdates,
        StageId::FinalizeBaseImage,
        StageId::ProvisionAndCapture,
        StageId::PostProcess,
        StageId::Distribute,
        StageId::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::ValidateEnvironment => "validate-environment",
            StageId::AcquireDrivers => "acquire-drivers",
            StageId::ValidateToolchain => "validate-toolchain",
            StageId::PrepareSideArtifacts => "prepare-side-artifacts",
            StageId::ResolveBaseImage => "resolve-base-image",
            StageId::ApplyUpdates => "apply-updates",
            StageId::FinalizeBaseImage => "finalize-base-image",
            StageId::ProvisionAndCapture => "provision-and-capture",
            StageId::PostProcess => "post-process",
            StageId::Distribute => "distribute",
            StageId::Cleanup => "cleanup",
        }
    }

    /// Overall progress percentage reported when the stage is entered.
    pub fn anchor(&self) -> u8 {
        match self {
            StageId::ValidateEnvironment => 0,
            StageId::AcquireDrivers => 5,
            StageId::ValidateToolchain => 12,
            StageId::PrepareSideArtifacts => 15,
            StageId::ResolveBaseImage => 20,
            StageId::ApplyUpdates => 35,
            StageId::FinalizeBaseImage => 55,
            StageId::ProvisionAndCapture => 60,
            StageId::PostProcess => 85,
            StageId::Distribute => 90,
            StageId::Cleanup => 97,
        }
    }

    /// Anchor of the following stage (100 after the last one).
    pub fn next_anchor(&self) -> u8 {
        Self::ALL
            .iter()
            .skip_while(|s| *s != self)
            .nth(1)
            .map(|s| s.anchor())
            .unwrap_or(100)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageId::ValidateEnvironment => "Validating environment",
            StageId::AcquireDrivers => "Downloading drivers",
            StageId::ValidateToolchain => "Checking external tools",
            StageId::PrepareSideArtifacts => "Preparing application media",
            StageId::ResolveBaseImage => "Resolving base image",
            StageId::ApplyUpdates => "Applying updates",
            StageId::FinalizeBaseImage => "Finalizing base image",
            StageId::ProvisionAndCapture => "Capturing image",
            StageId::PostProcess => "Post-processing image",
            StageId::Distribute => "Provisioning devices",
            StageId::Cleanup => "Cleaning up",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Skipped(&'static str),
}

/// Mutable state of one run.
#[derive(Debug, Default)]
pub struct RunState {
    pub run_id: String,

    /// Stages entered so far, in order
    pub entered: Vec<StageId>,
    pub skipped: Vec<StageId>,
    /// Stages whose cleanup ran during unwind, in the order they ran
    pub unwound: Vec<StageId>,
    /// Paths this run created, with the stage that owns them
    pub created: Vec<(StageId, PathBuf)>,

    /// resolve-base-image was served from the cache
    pub used_cache: bool,
    pub cache_hit: Option<CacheManifest>,
    pub registered: Option<CacheManifest>,

    pub drivers: Vec<PathBuf>,
    pub apps: Vec<PathBuf>,
    pub side_media: Option<PathBuf>,
    pub updates_applied: Vec<String>,

    /// Working copy of the base image in scratch
    pub volume: Option<PartitionHandle>,
    /// VM currently alive; None once destroyed
    pub vm: Option<VmHandle>,
    pub captured: Option<PathBuf>,
    /// Final artifact in the output directory
    pub artifact: Option<PathBuf>,
    pub distributed: Vec<WorkItem>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        RunState {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn enter(&mut self, stage: StageId) {
        self.entered.push(stage);
    }

    pub fn current_stage(&self) -> Option<StageId> {
        self.entered.last().copied()
    }

    pub fn was_entered(&self, stage: StageId) -> bool {
        self.entered.contains(&stage)
    }

    /// Remember that `stage` produced `path`; the unwind removes it.
    pub fn record_created(&mut self, stage: StageId, path: impl Into<PathBuf>) {
        self.created.push((stage, path.into()));
    }

    /// Like `record_created`, but only when nothing exists at `path` yet.
    /// Call before creating it: content that predates the run is never
    /// handed to the unwind.
    pub fn record_if_absent(&mut self, stage: StageId, path: impl Into<PathBuf>) {
        let path = path.into();
        if !path.exists() {
            self.created.push((stage, path));
        }
    }

    /// Paths owned by `stage`, most recent first.
    pub fn created_by(&self, stage: StageId) -> Vec<&Path> {
        self.created
            .iter()
            .rev()
            .filter(|(owner, _)| *owner == stage)
            .map(|(_, path)| path.as_path())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_anchors_are_monotonic() {
        for pair in StageId::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].anchor() < pair[1].anchor());
        }
        assert_eq!(StageId::Cleanup.next_anchor(), 100);
        assert_eq!(StageId::ResolveBaseImage.next_anchor(), StageId::ApplyUpdates.anchor());
    }

    #[test]
    fn test_stage_names_are_kebab_case() {
        assert_eq!(StageId::ProvisionAndCapture.to_string(), "provision-and-capture");
        assert_eq!(StageId::ResolveBaseImage.to_string(), "resolve-base-image");
    }

    #[test]
    fn test_created_paths_are_grouped_by_stage() {
        let mut state = RunState::new("r1");
        state.record_created(StageId::ResolveBaseImage, "/s/base.vhdx");
        state.record_created(StageId::ProvisionAndCapture, "/s/capture.ffu");
        state.record_created(StageId::ResolveBaseImage, "/s/mount");

        assert_eq!(
            state.created_by(StageId::ResolveBaseImage),
            vec![Path::new("/s/mount"), Path::new("/s/base.vhdx")]
        );
        assert!(state.created_by(StageId::Distribute).is_empty());
    }

    #[test]
    fn test_existing_paths_are_not_claimed() {
        let work = tempfile::tempdir().unwrap();
        let earlier = work.path().join("earlier.ffu");
        std::fs::write(&earlier, "previous run").unwrap();

        let mut state = RunState::new("r2");
        state.record_if_absent(StageId::PostProcess, &earlier);
        state.record_if_absent(StageId::PostProcess, work.path().join("fresh.ffu"));

        assert_eq!(
            state.created_by(StageId::PostProcess),
            vec![work.path().join("fresh.ffu").as_path()]
        );
    }
}
