//! Build Orchestration: fixed-order image pipeline with cache short-circuit and unwind.
//!
//! validate-environment -> acquire-drivers -> validate-toolchain ->
//! prepare-side-artifacts -> resolve-base-image -> apply-updates ->
//! finalize-base-image -> provision-and-capture -> post-process -> distribute ->
//! cleanup
//!
//! Stages run strictly one after another; only a stage's own batch fans out
//! through the task engine. When a stage fails, the cleanup of every entered
//! stage runs in reverse order, the run marker is removed and the original
//! error is returned.

mod stages;
pub mod state;

pub use state::{RunState, StageId, StageOutcome};

use crate::cache::ArtifactCache;
use crate::collaborators::Collaborators;
use crate::config::{validator, BuildConfiguration, CleanupScope};
use crate::error::{BuildError, Result};
use crate::log_collector::ProgressChannel;
use crate::recovery::{remove_path, CancelSignal, ProcessRegistry, RunMarker};
use crate::tasks::TaskEngine;
use std::path::PathBuf;
use std::sync::Arc;

/// Drives one build configuration through the pipeline.
pub struct Orchestrator {
    config: Arc<BuildConfiguration>,
    collaborators: Collaborators,
    progress: Arc<dyn ProgressChannel>,
    registry: ProcessRegistry,
    cancel: CancelSignal,
    cache: ArtifactCache,
    engine: TaskEngine,
}

impl Orchestrator {
    pub fn new(
        config: Arc<BuildConfiguration>,
        collaborators: Collaborators,
        progress: Arc<dyn ProgressChannel>,
        registry: ProcessRegistry,
        cancel: CancelSignal,
    ) -> Self {
        let cache = ArtifactCache::new(config.paths.cache_dir());
        let engine = TaskEngine::new(progress.clone(), cancel.clone());
        Orchestrator {
            config,
            collaborators,
            progress,
            registry,
            cancel,
            cache,
            engine,
        }
    }

    pub fn config(&self) -> &BuildConfiguration {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Run the whole pipeline and return the final artifact path.
    pub async fn run(&self) -> Result<PathBuf> {
        let mut state = RunState::new(uuid::Uuid::new_v4().to_string());
        self.execute(&mut state).await
    }

    /// Like `run`, with the caller owning the `RunState` so it can be
    /// inspected afterwards.
    pub async fn execute(&self, state: &mut RunState) -> Result<PathBuf> {
        // Fail fast: nothing is written for an unusable configuration
        if let Err(source) = validator::validate(&self.config) {
            let err = BuildError::Validation {
                stage: StageId::ValidateEnvironment,
                source,
            };
            self.report_failure(&err);
            return Err(err);
        }

        // An interrupted run's marker is the only record of what it left
        // behind; never replace it before a sweep has used it
        let marker_path = self.config.paths.marker_file();
        if RunMarker::exists(&marker_path) {
            let err = BuildError::StaleRun {
                stage: StageId::ValidateEnvironment,
                path: marker_path,
            };
            self.report_failure(&err);
            return Err(err);
        }

        if let Err(e) = self
            .registry
            .attach_marker(marker_path.clone(), RunMarker::new(state.run_id.clone()))
        {
            let err = BuildError::io(StageId::ValidateEnvironment, &marker_path, e);
            self.report_failure(&err);
            return Err(err);
        }

        log::info!("[Build] Starting run {}", state.run_id);

        for stage in StageId::ALL {
            if self.cancel.is_cancelled() {
                let err = BuildError::Cancelled { stage };
                return Err(self.abort(state, err).await);
            }

            state.enter(stage);
            self.progress.progress(stage.anchor(), stage.description());
            log::info!("[Build] [{}] Entering stage", stage);

            match self.run_stage(stage, state).await {
                Ok(StageOutcome::Completed) => {
                    log::info!("[Build] [{}] Completed", stage);
                }
                Ok(StageOutcome::Skipped(reason)) => {
                    state.skipped.push(stage);
                    log::info!("[Build] [{}] Skipped: {}", stage, reason);
                    self.progress.log(&format!("{}: skipped ({})", stage, reason));
                }
                Err(err) => return Err(self.abort(state, err).await),
            }
        }

        self.registry.detach_marker();
        if let Err(e) = RunMarker::remove(&marker_path) {
            log::warn!("[Build] Failed to remove run marker {}: {}", marker_path.display(), e);
        }

        let artifact = state.artifact.clone().ok_or_else(|| BuildError::Io {
            stage: StageId::PostProcess,
            path: self.config.paths.output_dir(),
            reason: "no artifact was produced".to_string(),
        })?;

        self.progress.progress(100, "Build complete");
        log::info!("[Build] Run {} produced {}", state.run_id, artifact.display());
        Ok(artifact)
    }

    async fn run_stage(&self, stage: StageId, state: &mut RunState) -> Result<StageOutcome> {
        match stage {
            StageId::ValidateEnvironment => self.validate_environment(state).await,
            StageId::AcquireDrivers => self.acquire_drivers(state).await,
            StageId::ValidateToolchain => self.validate_toolchain().await,
            StageId::PrepareSideArtifacts => self.prepare_side_artifacts(state).await,
            StageId::ResolveBaseImage => self.resolve_base_image(state).await,
            StageId::ApplyUpdates => self.apply_updates(state).await,
            StageId::FinalizeBaseImage => self.finalize_base_image(state).await,
            StageId::ProvisionAndCapture => self.provision_and_capture(state).await,
            StageId::PostProcess => self.post_process(state).await,
            StageId::Distribute => self.distribute(state).await,
            StageId::Cleanup => self.cleanup(state).await,
        }
    }

    /// Unwind then hand the original error back.
    async fn abort(&self, state: &mut RunState, err: BuildError) -> BuildError {
        self.report_failure(&err);
        self.unwind(state, err.is_cancellation()).await;
        err
    }

    fn report_failure(&self, err: &BuildError) {
        if err.is_cancellation() {
            log::warn!("[Build] {}", err);
            self.progress.log(&format!("Build cancelled during {}", err.stage()));
        } else {
            log::error!("[Build] {}", err);
            self.progress.log(&format!("Build failed: {}", err));
        }
    }

    /// Run every entered stage's cleanup in reverse order. Best-effort:
    /// failures are logged and never replace the original error.
    async fn unwind(&self, state: &mut RunState, cancelled: bool) {
        log::warn!("[Build] Unwinding {} stage(s)", state.entered.len());

        let entered = state.entered.clone();
        for stage in entered.into_iter().rev() {
            self.cleanup_stage(stage, state).await;
            state.unwound.push(stage);
        }

        // A cancel may be configured to clear the shared work directories too
        if cancelled && self.config.cleanup.cancel_scope == CleanupScope::All {
            remove_path(&self.config.paths.scratch_dir());
            remove_path(&self.config.paths.downloads_dir());
        }

        self.registry.detach_marker();
        let marker = self.config.paths.marker_file();
        if let Err(e) = RunMarker::remove(&marker) {
            log::warn!("[Build] Failed to remove run marker {}: {}", marker.display(), e);
        }
    }

    async fn cleanup_stage(&self, stage: StageId, state: &mut RunState) {
        log::info!("[Build] [{}] Cleanup", stage);

        if stage == StageId::ProvisionAndCapture {
            if let Some(vm) = state.vm.take() {
                match self.collaborators.vm.destroy(&vm.name).await {
                    Ok(()) => log::info!("[Build] [{}] Destroyed VM '{}'", stage, vm.name),
                    Err(e) => log::warn!("[Build] [{}] Failed to destroy VM '{}': {}", stage, vm.name, e),
                }
                self.registry.set_vm(None);
            }
        }

        let paths: Vec<PathBuf> = state.created_by(stage).into_iter().map(PathBuf::from).collect();
        for path in paths {
            remove_path(&path);
        }
    }
}
