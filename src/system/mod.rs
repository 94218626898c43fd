/// System module: external tool execution and host queries

pub mod runner;

use std::path::{Path, PathBuf};
use sysinfo::Disks;

pub use runner::{find_on_path, render_args, ToolOutput, ToolRunner};

/// Free bytes on the volume holding `path`.
///
/// Picks the disk with the longest mount point that prefixes the (absolute)
/// path. Returns None when no disk matches.
pub fn available_space(path: &Path) -> Option<u64> {
    let absolute = absolute_path(path);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| absolute.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Resolve `path` against the current directory without requiring it to exist.
fn absolute_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
