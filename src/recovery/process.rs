//! Process tracking and process-tree termination.
//!
//! Tools spawn helpers that spawn their own helpers, so the tree under a root
//! PID is discovered from the live process table at kill time rather than
//! remembered at spawn time.

use super::marker::{RecordedProcess, RunMarker};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One row of a process table snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub start_time: u64,
}

/// Access to the OS process table.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Vec<ProcessInfo>;

    /// Forcefully terminate one process. Returns false if it could not be signalled.
    fn kill(&self, pid: u32) -> bool;

    fn start_time(&self, pid: u32) -> Option<u64> {
        self.snapshot().into_iter().find(|p| p.pid == pid).map(|p| p.start_time)
    }
}

/// `ProcessTable` backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcessTable;

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent: process.parent().map(|p| p.as_u32()),
                start_time: process.start_time(),
            })
            .collect()
    }

    fn kill(&self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).map(|p| p.kill()).unwrap_or(false)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).map(|p| p.start_time())
    }
}

/// Kill order for the tree rooted at `root`: descendants deepest first, the
/// root last. A root absent from the snapshot yields just the root.
pub fn tree_kill_order(snapshot: &[ProcessInfo], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for info in snapshot {
        if let Some(parent) = info.parent {
            if parent != info.pid {
                children.entry(parent).or_default().push(info.pid);
            }
        }
    }

    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // Iterative post-order; (pid, children_pushed)
    let mut stack = vec![(root, false)];
    while let Some((pid, expanded)) = stack.pop() {
        if expanded {
            order.push(pid);
            continue;
        }
        if !visited.insert(pid) {
            continue;
        }
        stack.push((pid, true));
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !visited.contains(&kid) {
                    stack.push((kid, false));
                }
            }
        }
    }
    order
}

/// Kill the whole tree under `root` using `table`. Returns the PIDs signalled.
pub fn kill_tree_with(table: &dyn ProcessTable, root: u32) -> Vec<u32> {
    let snapshot = table.snapshot();
    let mut killed = Vec::new();
    for pid in tree_kill_order(&snapshot, root) {
        if table.kill(pid) {
            killed.push(pid);
        } else {
            log::debug!("[Recovery] Could not signal PID {} (already gone?)", pid);
        }
    }
    killed
}

/// Kill the whole tree under `root` in the live process table.
pub fn kill_tree(root: u32) -> Vec<u32> {
    kill_tree_with(&SysinfoProcessTable, root)
}

struct RegistryInner {
    processes: Vec<RecordedProcess>,
    marker: Option<(PathBuf, RunMarker)>,
}

/// Root PIDs of every tool the current run has running.
///
/// When a run marker is attached, every change is mirrored into it so an
/// interrupted run leaves enough behind for the next launch to clean up.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    table: Arc<dyn ProcessTable>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::with_table(Arc::new(SysinfoProcessTable))
    }
}

impl ProcessRegistry {
    pub fn with_table(table: Arc<dyn ProcessTable>) -> Self {
        ProcessRegistry {
            inner: Arc::new(Mutex::new(RegistryInner {
                processes: Vec::new(),
                marker: None,
            })),
            table,
        }
    }

    pub fn table(&self) -> Arc<dyn ProcessTable> {
        self.table.clone()
    }

    /// Mirror future changes into the marker at `path` and write it now.
    pub fn attach_marker(&self, path: PathBuf, marker: RunMarker) -> std::io::Result<()> {
        let mut inner = self.lock();
        let mut marker = marker;
        marker.processes = inner.processes.clone();
        marker.write(&path)?;
        inner.marker = Some((path, marker));
        Ok(())
    }

    /// Stop mirroring. The marker file itself is left alone.
    pub fn detach_marker(&self) {
        self.lock().marker = None;
    }

    pub fn register(&self, pid: u32) {
        let start_time = self.table.start_time(pid);
        let mut inner = self.lock();
        inner.processes.push(RecordedProcess { pid, start_time });
        Self::sync_marker(&mut inner);
    }

    pub fn unregister(&self, pid: u32) {
        let mut inner = self.lock();
        inner.processes.retain(|p| p.pid != pid);
        Self::sync_marker(&mut inner);
    }

    /// Record the VM the run created so a sweep can destroy it.
    pub fn set_vm(&self, name: Option<String>) {
        let mut inner = self.lock();
        if let Some((_, ref mut marker)) = inner.marker {
            marker.vm_name = name;
        }
        Self::sync_marker(&mut inner);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.lock().processes.iter().map(|p| p.pid).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // A poisoned registry still holds valid PIDs
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync_marker(inner: &mut RegistryInner) {
        let processes = inner.processes.clone();
        if let Some((ref path, ref mut marker)) = inner.marker {
            marker.processes = processes;
            if let Err(e) = marker.write(path) {
                log::warn!("[Recovery] Failed to update run marker {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Scripted process table: kills remove the row.
    pub(crate) struct FakeTable {
        pub rows: Mutex<Vec<ProcessInfo>>,
        pub killed: Mutex<Vec<u32>>,
    }

    impl FakeTable {
        pub fn new(rows: &[(u32, Option<u32>)]) -> Self {
            FakeTable {
                rows: Mutex::new(
                    rows.iter()
                        .map(|&(pid, parent)| ProcessInfo {
                            pid,
                            parent,
                            start_time: 100 + pid as u64,
                        })
                        .collect(),
                ),
                killed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProcessTable for FakeTable {
        fn snapshot(&self) -> Vec<ProcessInfo> {
            self.rows.lock().unwrap().clone()
        }

        fn kill(&self, pid: u32) -> bool {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| r.pid != pid);
            let hit = rows.len() != before;
            if hit {
                self.killed.lock().unwrap().push(pid);
            }
            hit
        }
    }

    #[test]
    fn test_tree_kill_order_children_before_parents() {
        // 1 -> 10 -> 100, 1 -> 11; 2 unrelated
        let table = FakeTable::new(&[(1, None), (10, Some(1)), (100, Some(10)), (11, Some(1)), (2, None)]);
        let order = tree_kill_order(&table.snapshot(), 1);

        assert_eq!(order.len(), 4);
        assert_eq!(*order.last().unwrap(), 1);
        let pos = |pid| order.iter().position(|&p| p == pid).unwrap();
        assert!(pos(100) < pos(10));
        assert!(pos(10) < pos(1));
        assert!(!order.contains(&2));
    }

    #[test]
    fn test_tree_kill_order_survives_cycles() {
        let rows = vec![
            ProcessInfo { pid: 5, parent: Some(6), start_time: 0 },
            ProcessInfo { pid: 6, parent: Some(5), start_time: 0 },
        ];
        let order = tree_kill_order(&rows, 5);
        assert_eq!(order, vec![6, 5]);
    }

    #[test]
    fn test_kill_tree_leaves_siblings() {
        let table = FakeTable::new(&[(1, None), (10, Some(1)), (100, Some(10)), (2, None), (20, Some(2))]);
        let killed = kill_tree_with(&table, 10);
        assert_eq!(killed, vec![100, 10]);
        let remaining: Vec<u32> = table.snapshot().iter().map(|r| r.pid).collect();
        assert_eq!(remaining, vec![1, 2, 20]);
    }

    #[test]
    fn test_registry_mirrors_into_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".run-marker");
        let registry = ProcessRegistry::with_table(Arc::new(FakeTable::new(&[(77, None)])));

        registry.attach_marker(path.clone(), RunMarker::new("r")).unwrap();
        registry.register(77);
        registry.set_vm(Some("ffu-capture".to_string()));

        let marker = RunMarker::read(&path).unwrap().unwrap();
        assert_eq!(
            marker.processes,
            vec![RecordedProcess {
                pid: 77,
                start_time: Some(177)
            }]
        );
        assert_eq!(marker.vm_name.as_deref(), Some("ffu-capture"));

        registry.unregister(77);
        assert!(RunMarker::read(&path).unwrap().unwrap().processes.is_empty());
        assert!(registry.pids().is_empty());
    }
}
