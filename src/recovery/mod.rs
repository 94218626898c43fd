//! Cancellation & recovery.
//!
//! - `CancelSignal` / `CancelTrigger`: the cancellation token handed to every
//!   long-running call (tool runs, VM polling, task workers)
//! - `ProcessRegistry`: root PIDs of running tools, mirrored into the run marker
//! - `RecoveryController::cancel`: tear down a run in progress
//! - `RecoveryController::sweep_stale_run`: clean up after a run that never
//!   removed its marker
//!
//! Every cleanup step is best-effort and logged; nothing here returns an error
//! to the caller.

pub mod marker;
pub mod process;

use crate::collaborators::VmProvider;
use crate::config::BuildConfiguration;
use crate::log_collector::{ProgressChannel, ProgressTail};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use marker::{RecordedProcess, RunMarker};
pub use process::{kill_tree, kill_tree_with, tree_kill_order, ProcessInfo, ProcessRegistry, ProcessTable, SysinfoProcessTable};

/// Receiving half of the cancellation token.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the trigger
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sending half of the cancellation token.
#[derive(Clone, Debug)]
pub struct CancelTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal { rx: self.tx.subscribe() }
    }
}

pub fn cancel_pair() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Unwinds in-progress and interrupted runs.
pub struct RecoveryController {
    progress: Arc<dyn ProgressChannel>,
    registry: ProcessRegistry,
    trigger: CancelTrigger,
    tail: Mutex<Option<ProgressTail>>,
    /// Removed wholesale by a stale-run sweep
    sweep_dirs: Vec<PathBuf>,
    vm: Option<Arc<dyn VmProvider>>,
    /// Destroyed by a sweep when the marker cannot be read
    fallback_vm: Option<String>,
}

impl RecoveryController {
    pub fn new(progress: Arc<dyn ProgressChannel>, registry: ProcessRegistry, trigger: CancelTrigger) -> Self {
        RecoveryController {
            progress,
            registry,
            trigger,
            tail: Mutex::new(None),
            sweep_dirs: Vec::new(),
            vm: None,
            fallback_vm: None,
        }
    }

    /// Controller for `config`: the broad sweep covers scratch and downloads,
    /// never the cache, the output directory or user sources.
    pub fn for_config(
        config: &BuildConfiguration,
        progress: Arc<dyn ProgressChannel>,
        registry: ProcessRegistry,
        trigger: CancelTrigger,
        vm: Arc<dyn VmProvider>,
    ) -> Self {
        Self::new(progress, registry, trigger)
            .with_sweep_dirs(vec![config.paths.scratch_dir(), config.paths.downloads_dir()])
            .with_vm(vm, Some(config.vm.name.clone()))
    }

    pub fn with_sweep_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.sweep_dirs = dirs;
        self
    }

    pub fn with_vm(mut self, vm: Arc<dyn VmProvider>, fallback_name: Option<String>) -> Self {
        self.vm = Some(vm);
        self.fallback_vm = fallback_name;
        self
    }

    /// Hand over the log-tailing handle a monitor is using so cancel can release it.
    pub fn attach_tail(&self, tail: ProgressTail) {
        if let Ok(mut slot) = self.tail.lock() {
            *slot = Some(tail);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.trigger.is_cancelled()
    }

    /// Cancel the run executing in `run`.
    ///
    /// Signals the token (which stops every polling loop), releases the log
    /// tail, kills every registered tool's process tree, then waits for the
    /// run to finish its own unwind. Returns the run's result, or None if the
    /// run task itself panicked.
    pub async fn cancel<T>(&self, run: JoinHandle<T>) -> Option<T> {
        log::warn!("[Recovery] Cancellation requested");
        self.progress.log("Cancellation requested, stopping build");

        // 1. Stop polling
        self.trigger.cancel();

        // 2. Release the tail
        if let Ok(mut slot) = self.tail.lock() {
            if let Some(mut tail) = slot.take() {
                tail.close();
            }
        }

        // 3. Kill process trees, walking the live table
        self.kill_registered_trees();

        // 4. The run observes the token and unwinds its current-run artifacts
        match run.await {
            Ok(result) => {
                self.progress.log("Build cancelled, cleanup complete");
                Some(result)
            }
            Err(e) => {
                log::error!("[Recovery] Run task ended abnormally: {}", e);
                None
            }
        }
    }

    fn kill_registered_trees(&self) {
        let table = self.registry.table();
        for root in self.registry.pids() {
            let killed = kill_tree_with(table.as_ref(), root);
            log::info!("[Recovery] Terminated process tree of PID {} ({} process(es))", root, killed.len());
        }
    }

    /// Clean up after an interrupted run. Returns true when a marker was
    /// found (and the sweep ran), false when there was nothing to do.
    pub async fn sweep_stale_run(&self, marker_path: &Path) -> bool {
        if !RunMarker::exists(marker_path) {
            return false;
        }

        log::warn!(
            "[Recovery] Found run marker {} from an interrupted run, sweeping",
            marker_path.display()
        );
        self.progress.log("Previous run did not finish, cleaning up");

        let vm_name = match RunMarker::read(marker_path) {
            Ok(Some(marker)) => {
                log::info!("[Recovery] Stale run {} started {}", marker.run_id, marker.created_at);
                self.kill_recorded(&marker.processes);
                marker.vm_name
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("[Recovery] Run marker unreadable ({}), using broad cleanup", e);
                self.fallback_vm.clone()
            }
        };

        if let (Some(name), Some(vm)) = (vm_name, self.vm.as_ref()) {
            match vm.destroy(&name).await {
                Ok(()) => log::info!("[Recovery] Destroyed leftover VM '{}'", name),
                Err(e) => log::warn!("[Recovery] Failed to destroy VM '{}': {}", name, e),
            }
        }

        for dir in &self.sweep_dirs {
            remove_path(dir);
        }

        match RunMarker::remove(marker_path) {
            Ok(()) => log::info!("[Recovery] Sweep complete, run marker removed"),
            Err(e) => log::warn!("[Recovery] Failed to remove run marker {}: {}", marker_path.display(), e),
        }
        true
    }

    fn kill_recorded(&self, processes: &[RecordedProcess]) {
        let table = self.registry.table();
        for recorded in processes {
            // A PID whose start time changed belongs to someone else now
            let live = table.start_time(recorded.pid);
            match (live, recorded.start_time) {
                (Some(live), Some(expected)) if live == expected => {
                    let killed = kill_tree_with(table.as_ref(), recorded.pid);
                    log::info!(
                        "[Recovery] Killed orphaned tool tree of PID {} ({} process(es))",
                        recorded.pid,
                        killed.len()
                    );
                }
                (None, _) => log::debug!("[Recovery] PID {} no longer running", recorded.pid),
                _ => log::info!("[Recovery] PID {} was reused, leaving it alone", recorded.pid),
            }
        }
    }
}

/// Best-effort removal of a file or directory tree.
pub(crate) fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        return;
    };
    match result {
        Ok(()) => log::info!("[Recovery] Removed {}", path.display()),
        Err(e) => log::warn!("[Recovery] Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::process::tests::FakeTable;
    use super::*;
    use crate::error::CollaboratorError;
    use crate::log_collector::MemoryChannel;
    use crate::models::{PowerState, VmHandle, VmSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingVm {
        destroyed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VmProvider for RecordingVm {
        async fn create(&self, spec: &VmSpec) -> Result<VmHandle, CollaboratorError> {
            Ok(VmHandle { name: spec.name.clone() })
        }
        async fn start(&self, _vm: &VmHandle) -> Result<(), CollaboratorError> {
            Ok(())
        }
        async fn power_state(&self, _vm: &VmHandle) -> Result<PowerState, CollaboratorError> {
            Ok(PowerState::Off)
        }
        async fn destroy(&self, name: &str) -> Result<(), CollaboratorError> {
            self.destroyed.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_signal_resolves_after_trigger() {
        let (trigger, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            signal.is_cancelled()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
        assert!(waiter.await.unwrap());
        assert!(trigger.signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_cancels() {
        let (trigger, mut signal) = cancel_pair();
        drop(trigger);
        let waited = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_cancel_kills_trees_and_awaits_run() {
        let table = Arc::new(FakeTable::new(&[(1, None), (50, Some(1)), (51, Some(50)), (52, Some(51))]));
        let registry = ProcessRegistry::with_table(table.clone());
        registry.register(50);

        let (trigger, signal) = cancel_pair();
        let controller = RecoveryController::new(Arc::new(MemoryChannel::new()), registry, trigger);

        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("progress.log");
        std::fs::write(&log_path, "").unwrap();
        controller.attach_tail(ProgressTail::open(&log_path).unwrap());

        let mut run_signal = signal.clone();
        let run = tokio::spawn(async move {
            run_signal.cancelled().await;
            "unwound"
        });

        assert_eq!(controller.cancel(run).await, Some("unwound"));
        assert!(signal.is_cancelled());
        assert_eq!(*table.killed.lock().unwrap(), vec![52, 51, 50]);
        assert!(controller.tail.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_without_marker_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        let (trigger, _signal) = cancel_pair();
        let controller = RecoveryController::new(Arc::new(MemoryChannel::new()), ProcessRegistry::default(), trigger)
            .with_sweep_dirs(vec![scratch.clone()]);

        assert!(!controller.sweep_stale_run(&dir.path().join(".run-marker")).await);
        assert!(scratch.exists());
    }

    #[tokio::test]
    async fn test_sweep_cleans_and_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(scratch.join("mount")).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("img-1.bin"), b"keep").unwrap();

        // 60 is our orphan (start time matches), 61 is a reused PID
        let table = Arc::new(FakeTable::new(&[(60, None), (600, Some(60)), (61, None)]));
        let marker_path = dir.path().join(".run-marker");
        let mut marker = RunMarker::new("stale");
        marker.processes = vec![
            RecordedProcess { pid: 60, start_time: Some(160) },
            RecordedProcess { pid: 61, start_time: Some(5) },
        ];
        marker.vm_name = Some("ffu-capture".to_string());
        marker.write(&marker_path).unwrap();

        let vm = Arc::new(RecordingVm::default());
        let (trigger, _signal) = cancel_pair();
        let controller = RecoveryController::new(
            Arc::new(MemoryChannel::new()),
            ProcessRegistry::with_table(table.clone()),
            trigger,
        )
        .with_sweep_dirs(vec![scratch.clone()])
        .with_vm(vm.clone(), None);

        assert!(controller.sweep_stale_run(&marker_path).await);
        assert!(!marker_path.exists());
        assert!(!scratch.exists());
        assert!(cache.join("img-1.bin").exists());
        assert_eq!(*table.killed.lock().unwrap(), vec![600, 60]);
        assert_eq!(*vm.destroyed.lock().unwrap(), vec!["ffu-capture".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_marker_still_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let marker_path = dir.path().join(".run-marker");
        std::fs::write(&marker_path, b"\x00\x01garbage").unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();

        let vm = Arc::new(RecordingVm::default());
        let (trigger, _signal) = cancel_pair();
        let controller = RecoveryController::new(Arc::new(MemoryChannel::new()), ProcessRegistry::default(), trigger)
            .with_sweep_dirs(vec![downloads.clone()])
            .with_vm(vm.clone(), Some("ffu-capture".to_string()));

        assert!(controller.sweep_stale_run(&marker_path).await);
        assert!(!marker_path.exists());
        assert!(!downloads.exists());
        assert_eq!(*vm.destroyed.lock().unwrap(), vec!["ffu-capture".to_string()]);
    }
}
