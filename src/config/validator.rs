//! Config validation.
//!
//! Everything here runs before a run marker is written, so a rejected
//! configuration leaves no trace on disk.

use super::BuildConfiguration;
use crate::error::ConfigError;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Validate a fully merged configuration.
pub fn validate(config: &BuildConfiguration) -> Result<(), ConfigError> {
    validate_identity(config)?;

    if config.image_source.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "image_source must point at the base install image".to_string(),
        ));
    }

    if config.image_index == 0 {
        return Err(ConfigError::ValidationFailed(
            "image_index is 1-based and cannot be 0".to_string(),
        ));
    }

    if config.vm.poll_interval_secs == 0 {
        return Err(ConfigError::ValidationFailed(
            "vm.poll_interval_secs must be at least 1".to_string(),
        ));
    }

    if config.output_name.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "output_name cannot be empty".to_string(),
        ));
    }

    validate_paths(config)?;

    ensure_unique(
        "updates.packages",
        config.updates.packages.iter().map(|p| p.file.as_str()),
    )?;
    ensure_unique("drivers", config.drivers.iter().map(|d| d.id.as_str()))?;
    ensure_unique("apps", config.apps.iter().map(|a| a.id.as_str()))?;
    ensure_unique("devices", config.devices.iter().map(|d| d.as_str()))?;

    if config.updates.download {
        if let Some(missing) = config.updates.packages.iter().find(|p| p.source.is_none()) {
            return Err(ConfigError::ValidationFailed(format!(
                "update '{}' has no download source (set updates.download = false to use local files)",
                missing.file
            )));
        }
    }

    Ok(())
}

/// Fields that make up the cache fingerprint must be usable.
pub fn validate_identity(config: &BuildConfiguration) -> Result<(), ConfigError> {
    if config.edition.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "edition cannot be empty".to_string(),
        ));
    }

    if config.version.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "version cannot be empty".to_string(),
        ));
    }

    if config.release == 0 {
        return Err(ConfigError::ValidationFailed(
            "release must be a positive number".to_string(),
        ));
    }

    if config.optional_features.iter().any(|f| f.trim().is_empty()) {
        return Err(ConfigError::ValidationFailed(
            "optional_features cannot contain empty names".to_string(),
        ));
    }

    Ok(())
}

/// Scratch and downloads are deleted wholesale by cleanup, unwind and the
/// stale-run sweep, so neither may contain the cache, the output directory or
/// the install image.
fn validate_paths(config: &BuildConfiguration) -> Result<(), ConfigError> {
    let paths = &config.paths;
    let kept = [
        ("cache_dir", paths.cache_dir()),
        ("output_dir", paths.output_dir()),
        ("image_source", config.image_source.clone()),
    ];
    for (removable_name, removable) in [("scratch_dir", paths.scratch_dir()), ("downloads_dir", paths.downloads_dir())] {
        let removable_abs = normalize(&removable);
        for (kept_name, kept_path) in &kept {
            if normalize(kept_path).starts_with(&removable_abs) {
                return Err(ConfigError::ValidationFailed(format!(
                    "paths.{} ({}) would be deleted with {} ({})",
                    kept_name,
                    kept_path.display(),
                    removable_name,
                    removable.display()
                )));
            }
        }
    }
    Ok(())
}

/// Absolute form of `path` with `.` and `..` folded, without touching the
/// filesystem (the directories usually do not exist yet).
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn ensure_unique<'a>(what: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "{} contains an empty identifier",
                what
            )));
        }
        if !seen.insert(id) {
            return Err(ConfigError::ValidationFailed(format!(
                "{} contains duplicate identifier '{}'",
                what, id
            )));
        }
    }
    Ok(())
}
