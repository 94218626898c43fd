//! Stage bodies.

use super::{Orchestrator, RunState, StageId, StageOutcome};
use crate::cache::{CacheFingerprint, RetentionPolicy};
use crate::collaborators::Fetcher;
use crate::error::{BuildError, CollaboratorError, ConfigError, Result};
use crate::log_collector::ProgressEvent;
use crate::models::{CaptureMode, PartitionHandle, PowerState, VmHandle, VmSpec};
use crate::tasks::{
    BatchPolicy, FetchHandler, HandlerTable, ProvisionHandler, TaskArguments, TaskPayload, TaskType, WorkItem,
    WorkStatus,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BASE_IMAGE_FILE: &str = "base-image.vhdx";
const CAPTURE_FILE: &str = "capture.ffu";
const SIDE_MEDIA_FILE: &str = "apps.iso";
const GIB: u64 = 1024 * 1024 * 1024;

impl Orchestrator {
    pub(super) async fn validate_environment(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::ValidateEnvironment;
        let config = &self.config;

        if !config.image_source.exists() {
            return Err(BuildError::Validation {
                stage,
                source: ConfigError::FileNotFound(config.image_source.display().to_string()),
            });
        }

        if config.min_free_space_gb > 0 {
            let required = gib_to_bytes(config.min_free_space_gb);
            match crate::system::available_space(&config.paths.workspace) {
                Some(free) if free < required => {
                    return Err(BuildError::Validation {
                        stage,
                        source: ConfigError::ValidationFailed(format!(
                            "{} GiB free on the workspace volume, {} GiB required",
                            free / GIB,
                            config.min_free_space_gb
                        )),
                    });
                }
                Some(_) => {}
                None => log::warn!("[Build] [{}] Could not determine free space, continuing", stage),
            }
        }

        let scratch = config.paths.scratch_dir();
        state.record_if_absent(stage, &scratch);
        for dir in [scratch, config.paths.output_dir(), config.paths.downloads_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(stage, &dir, e))?;
        }
        Ok(StageOutcome::Completed)
    }

    pub(super) async fn acquire_drivers(&self, state: &mut RunState) -> Result<StageOutcome> {
        if self.config.drivers.is_empty() {
            return Ok(StageOutcome::Skipped("no drivers configured"));
        }
        let requests = self.config.drivers.iter().map(|d| (d.id.clone(), d.id.clone())).collect();
        let fetched = self
            .fetch_batch(
                StageId::AcquireDrivers,
                TaskType::DriverDownload,
                requests,
                &self.config.paths.drivers_dir(),
                self.collaborators.driver_fetcher.clone(),
                state,
            )
            .await?;
        state.drivers = fetched.into_values().collect();
        Ok(StageOutcome::Completed)
    }

    pub(super) async fn validate_toolchain(&self) -> Result<StageOutcome> {
        self.collaborators
            .toolchain
            .verify()
            .await
            .map_err(|e| BuildError::collaborator(StageId::ValidateToolchain, e))?;
        Ok(StageOutcome::Completed)
    }

    pub(super) async fn prepare_side_artifacts(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::PrepareSideArtifacts;
        if self.config.apps.is_empty() {
            return Ok(StageOutcome::Skipped("no applications configured"));
        }

        let apps_dir = self.config.paths.apps_dir();
        let requests = self.config.apps.iter().map(|a| (a.id.clone(), a.id.clone())).collect();
        let fetched = self
            .fetch_batch(
                stage,
                TaskType::AppDownload,
                requests,
                &apps_dir,
                self.collaborators.app_fetcher.clone(),
                state,
            )
            .await?;
        state.apps = fetched.into_values().collect();

        let destination = self.config.paths.scratch_dir().join(SIDE_MEDIA_FILE);
        state.record_if_absent(stage, &destination);
        let media = self
            .collaborators
            .media
            .author(&apps_dir, &destination)
            .await
            .map_err(|e| BuildError::collaborator(stage, e))?;
        state.side_media = Some(media);
        Ok(StageOutcome::Completed)
    }

    /// Cache lookup; on a hit the next two stages have nothing to do.
    pub(super) async fn resolve_base_image(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::ResolveBaseImage;
        let working = self.config.paths.scratch_dir().join(BASE_IMAGE_FILE);
        let fingerprint = CacheFingerprint::from_config(&self.config);

        let hit = if self.config.cache.enabled {
            self.cache.lookup(&fingerprint)
        } else {
            None
        };

        state.record_if_absent(stage, &working);
        match hit {
            Some(manifest) => {
                let cached = self.cache.artifact_path(&manifest);
                self.progress
                    .log(&format!("Using cached base image {}", manifest.artifact_file_name));
                tokio::fs::copy(&cached, &working)
                    .await
                    .map_err(|e| BuildError::io(stage, &cached, e))?;
                state.volume = Some(PartitionHandle::for_image(working));
                state.used_cache = true;
                state.cache_hit = Some(manifest);
            }
            None => {
                self.progress.log("No cached base image, applying from source");
                let handle = self
                    .collaborators
                    .base_image
                    .apply(&self.config.image_source, &working, self.config.image_index)
                    .await
                    .map_err(|e| BuildError::collaborator(stage, e))?;
                state.volume = Some(handle);
            }
        }
        Ok(StageOutcome::Completed)
    }

    /// Servicing stack first, then cumulative, .NET and feature packages.
    pub(super) async fn apply_updates(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::ApplyUpdates;
        if state.used_cache {
            return Ok(StageOutcome::Skipped("base image came from cache"));
        }
        if self.config.updates.packages.is_empty() {
            return Ok(StageOutcome::Skipped("no updates configured"));
        }

        let updates_dir = self.config.paths.updates_dir();
        let mut locations: HashMap<String, PathBuf> = if self.config.updates.download {
            let requests = self
                .config
                .updates
                .packages
                .iter()
                .map(|p| (p.file.clone(), p.file.clone()))
                .collect();
            self.fetch_batch(
                stage,
                TaskType::UpdateDownload,
                requests,
                &updates_dir,
                self.collaborators.update_fetcher.clone(),
                state,
            )
            .await?
        } else {
            HashMap::new()
        };

        let mut packages = self.config.updates.packages.clone();
        packages.sort_by_key(|p| p.kind);

        let volume = self.volume(state, stage)?;
        let total = packages.len();
        let (start, end) = (stage.anchor(), stage.next_anchor());
        for (index, package) in packages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled { stage });
            }
            let path = locations
                .remove(&package.file)
                .unwrap_or_else(|| updates_dir.join(&package.file));
            if !path.is_file() {
                return Err(BuildError::Io {
                    stage,
                    path,
                    reason: "update package not found".to_string(),
                });
            }

            let percent = start + ((end - start) as usize * index / total) as u8;
            self.progress
                .progress(percent, &format!("Applying {} ({}/{})", package.file, index + 1, total));
            self.collaborators
                .updates
                .apply_package(&volume, &path)
                .await
                .map_err(|e| BuildError::collaborator(stage, e))?;
            state.updates_applied.push(package.file.clone());
        }
        Ok(StageOutcome::Completed)
    }

    pub(super) async fn finalize_base_image(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::FinalizeBaseImage;
        if state.used_cache {
            return Ok(StageOutcome::Skipped("base image came from cache"));
        }
        if !self.config.cache.enabled {
            return Ok(StageOutcome::Skipped("caching disabled"));
        }

        let volume = self.volume(state, stage)?;
        let fingerprint = CacheFingerprint::from_config(&self.config);
        let manifest = self
            .cache
            .register(&fingerprint, &volume.image)
            .map_err(|source| BuildError::Cache { stage, source })?;
        self.progress
            .log(&format!("Cached base image as {}", manifest.artifact_file_name));
        state.registered = Some(manifest);

        if let Some(keep) = self.config.cache.retain_latest {
            let policy = RetentionPolicy {
                keep_latest: Some(keep),
                max_age_days: None,
            };
            if let Err(e) = self.cache.prune(policy) {
                log::warn!("[Cache] Pruning failed: {}", e);
            }
        }
        Ok(StageOutcome::Completed)
    }

    pub(super) async fn provision_and_capture(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::ProvisionAndCapture;
        let volume = self.volume(state, stage)?;
        let destination = self.config.paths.scratch_dir().join(CAPTURE_FILE);
        state.record_if_absent(stage, &destination);

        if self.config.capture == CaptureMode::Vm {
            let spec = VmSpec {
                name: self.config.vm.name.clone(),
                disk: volume.image.clone(),
                memory_mb: self.config.vm.memory_mb,
                processors: self.config.vm.processors,
            };
            let vm = self
                .collaborators
                .vm
                .create(&spec)
                .await
                .map_err(|e| BuildError::collaborator(stage, e))?;
            state.vm = Some(vm.clone());
            self.registry.set_vm(Some(vm.name.clone()));

            self.collaborators
                .vm
                .start(&vm)
                .await
                .map_err(|e| BuildError::collaborator(stage, e))?;
            self.wait_for_power_off(&vm).await?;
        }

        let captured = self
            .collaborators
            .capture
            .capture(&volume, &destination)
            .await
            .map_err(|e| BuildError::collaborator(stage, e))?;
        state.captured = Some(captured);

        if let Some(vm) = state.vm.take() {
            if let Err(e) = self.collaborators.vm.destroy(&vm.name).await {
                log::warn!("[Build] [{}] Failed to destroy VM '{}': {}", stage, vm.name, e);
            }
            self.registry.set_vm(None);
        }
        Ok(StageOutcome::Completed)
    }

    /// Poll until the VM reports off. Cancellation is checked on every tick;
    /// without a configured timeout the wait is unbounded.
    async fn wait_for_power_off(&self, vm: &VmHandle) -> Result<()> {
        let stage = StageId::ProvisionAndCapture;
        let interval = Duration::from_secs(self.config.vm.poll_interval_secs.max(1));
        let timeout = self.config.vm.power_off_timeout_secs.map(Duration::from_secs);
        let started = Instant::now();
        let mut cancel = self.cancel.clone();

        self.progress
            .log(&format!("Waiting for VM '{}' to power off", vm.name));
        loop {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled { stage });
            }

            match self
                .collaborators
                .vm
                .power_state(vm)
                .await
                .map_err(|e| BuildError::collaborator(stage, e))?
            {
                PowerState::Off => {
                    log::info!("[Build] [{}] VM '{}' is off after {:?}", stage, vm.name, started.elapsed());
                    return Ok(());
                }
                PowerState::Running => {}
                PowerState::Other(raw) => log::debug!("[Build] [{}] VM state '{}'", stage, raw),
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(BuildError::collaborator(
                        stage,
                        CollaboratorError::Timeout {
                            what: format!("VM '{}' to power off", vm.name),
                            secs: limit.as_secs(),
                        },
                    ));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(BuildError::Cancelled { stage }),
            }
        }
    }

    pub(super) async fn post_process(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::PostProcess;
        let captured = state.captured.clone().ok_or_else(|| BuildError::Io {
            stage,
            path: self.config.paths.scratch_dir().join(CAPTURE_FILE),
            reason: "nothing was captured".to_string(),
        })?;

        self.collaborators
            .capture
            .optimize(&captured)
            .await
            .map_err(|e| BuildError::collaborator(stage, e))?;

        let output_dir = self.config.paths.output_dir();
        let final_path = reserve_output(&output_dir, &self.config.render_output_name())
            .map_err(|e| BuildError::io(stage, &output_dir, e))?;
        state.record_created(stage, final_path.clone());
        move_file(&captured, &final_path)
            .await
            .map_err(|e| BuildError::io(stage, &final_path, e))?;

        self.progress
            .log(&format!("Artifact written to {}", final_path.display()));
        state.artifact = Some(final_path);
        Ok(StageOutcome::Completed)
    }

    /// One device failing does not fail the others; the stage fails only
    /// when no device was provisioned.
    pub(super) async fn distribute(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = StageId::Distribute;
        if self.config.devices.is_empty() {
            return Ok(StageOutcome::Skipped("no target devices"));
        }
        let artifact = state.artifact.clone().ok_or_else(|| BuildError::Io {
            stage,
            path: self.config.paths.output_dir(),
            reason: "no artifact to distribute".to_string(),
        })?;

        let items = self
            .config
            .devices
            .iter()
            .map(|device| {
                WorkItem::new(
                    device.clone(),
                    TaskType::DeviceProvision,
                    TaskArguments::Provision {
                        device_id: device.clone(),
                        artifact: artifact.clone(),
                    },
                )
            })
            .collect();
        let handlers = HandlerTable::new().with(
            TaskType::DeviceProvision,
            Arc::new(ProvisionHandler::new(self.collaborators.devices.clone())),
        );

        let done = self
            .engine
            .run_batch(items, &handlers, self.config.concurrency.devices)
            .await;
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled { stage });
        }

        for item in done.iter().filter(|i| !i.succeeded()) {
            if let Some(summary) = item.failure_summary() {
                self.progress.log(&format!("Device failed: {}", summary));
            }
        }
        let outcome = BatchPolicy::AnySuccess.evaluate(&done);
        state.distributed = done;
        outcome.map_err(|failed| BuildError::Batch { stage, failed })?;
        Ok(StageOutcome::Completed)
    }

    pub(super) async fn cleanup(&self, _state: &mut RunState) -> Result<StageOutcome> {
        if self.config.cleanup.remove_scratch {
            crate::recovery::remove_path(&self.config.paths.scratch_dir());
        }
        if self.config.cleanup.remove_downloads {
            crate::recovery::remove_path(&self.config.paths.downloads_dir());
        }
        Ok(StageOutcome::Completed)
    }

    fn volume(&self, state: &RunState, stage: StageId) -> Result<PartitionHandle> {
        state.volume.clone().ok_or_else(|| BuildError::Io {
            stage,
            path: self.config.paths.scratch_dir().join(BASE_IMAGE_FILE),
            reason: "base image was not resolved".to_string(),
        })
    }

    /// Download `requests` (item id, fetch identifier), each into its own
    /// directory under `destination`. Every item must succeed. An item whose
    /// directory already holds a completed download is reused without
    /// fetching. Returns item id -> file path; only directories this call
    /// created are owned by `stage` for unwind.
    async fn fetch_batch(
        &self,
        stage: StageId,
        task_type: TaskType,
        requests: Vec<(String, String)>,
        destination: &Path,
        fetcher: Arc<dyn Fetcher>,
        state: &mut RunState,
    ) -> Result<HashMap<String, PathBuf>> {
        let mut fetched = HashMap::new();
        let mut items = Vec::new();
        let mut new_dirs = HashSet::new();
        for (id, identifier) in requests {
            let item_dir = destination.join(&id);
            if let Some(existing) = completed_download(&item_dir) {
                log::info!("[Build] [{}] Reusing downloaded {}", stage, existing.display());
                self.progress.emit(ProgressEvent::ItemStatus {
                    id: id.clone(),
                    status: WorkStatus::Succeeded,
                });
                fetched.insert(id, existing);
                continue;
            }
            if !item_dir.exists() {
                new_dirs.insert(id.clone());
            }
            items.push(WorkItem::new(
                id,
                task_type,
                TaskArguments::Fetch {
                    identifier,
                    destination: item_dir,
                },
            ));
        }
        if items.is_empty() {
            return Ok(fetched);
        }

        let handlers = HandlerTable::new().with(task_type, Arc::new(FetchHandler::new(fetcher)));
        let done = self
            .engine
            .run_batch(items, &handlers, self.config.concurrency.downloads)
            .await;

        for item in &done {
            // Partial downloads go too, as long as the directory is ours
            if new_dirs.contains(&item.id) {
                state.record_created(stage, destination.join(&item.id));
            }
            if let Some(TaskPayload::Fetched(ref path)) = item.result {
                fetched.insert(item.id.clone(), path.clone());
            }
        }

        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled { stage });
        }
        BatchPolicy::AllMustSucceed
            .evaluate(&done)
            .map_err(|failed| BuildError::Batch { stage, failed })?;
        Ok(fetched)
    }
}

fn gib_to_bytes(gb: u64) -> u64 {
    gb.saturating_mul(GIB)
}

/// A finished download in `item_dir`: the directory's first regular file,
/// ignoring dot-files (in-flight temp files). A plain file at `item_dir`
/// itself counts as well.
fn completed_download(item_dir: &Path) -> Option<PathBuf> {
    if item_dir.is_file() {
        return Some(item_dir.to_path_buf());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(item_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    files.into_iter().next()
}

/// Claim a name in `dir` that no existing file uses: `name` itself, else
/// `<stem>-1.<ext>`, `<stem>-2.<ext>`, ... The file is created empty so a
/// concurrent run cannot take the same name.
fn reserve_output(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let candidate = Path::new(name);
    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = candidate.extension().map(|e| e.to_string_lossy().into_owned());

    for attempt in 0u32.. {
        let file_name = match (attempt, &extension) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{}-{}.{}", stem, n, ext),
            (n, None) => format!("{}-{}", stem, n),
        };
        let path = dir.join(file_name);
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                if attempt > 0 {
                    log::warn!(
                        "[Build] {} already exists, writing {} instead",
                        dir.join(name).display(),
                        path.display()
                    );
                }
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free output name for {}", name),
    ))
}

/// Rename, falling back to copy + delete across volumes.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_requirement_saturates() {
        assert_eq!(gib_to_bytes(2), 2 * GIB);
        assert_eq!(gib_to_bytes(u64::MAX), u64::MAX);
        assert_eq!(gib_to_bytes(u64::MAX / GIB + 1), u64::MAX);
    }

    #[test]
    fn test_reserve_output_never_reuses_a_name() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("Win11_Pro.ffu"), "earlier").unwrap();

        let first = reserve_output(work.path(), "Win11_Pro.ffu").unwrap();
        let second = reserve_output(work.path(), "Win11_Pro.ffu").unwrap();

        assert_eq!(first, work.path().join("Win11_Pro-1.ffu"));
        assert_eq!(second, work.path().join("Win11_Pro-2.ffu"));
        assert_eq!(std::fs::read_to_string(work.path().join("Win11_Pro.ffu")).unwrap(), "earlier");
    }

    #[test]
    fn test_completed_download_ignores_temp_files() {
        let work = tempfile::tempdir().unwrap();
        let item = work.path().join("latitude");
        assert_eq!(completed_download(&item), None);

        std::fs::create_dir_all(&item).unwrap();
        std::fs::write(item.join(".tmpA1b2"), "partial").unwrap();
        assert_eq!(completed_download(&item), None);

        std::fs::write(item.join("latitude.zip"), "done").unwrap();
        assert_eq!(completed_download(&item), Some(item.join("latitude.zip")));
    }
}
