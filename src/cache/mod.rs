//! Content-addressable store for base images.
//!
//! Layout: one flat directory of `img-<id>.bin` artifacts, each with a
//! `img-<id>.json` manifest recording the fingerprint it was built from.
//! Manifests are write-once; a different fingerprint always produces a new
//! pair. Lookup is read-only.

pub mod fingerprint;
pub mod manifest;

use crate::error::CacheError;
use chrono::{DateTime, Duration, Utc};
use std::io;
use std::path::{Path, PathBuf};

pub use fingerprint::CacheFingerprint;
pub use manifest::CacheManifest;

/// Which entries `prune` keeps. The default keeps everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many newest entries
    pub keep_latest: Option<usize>,
    /// Drop entries older than this many days
    pub max_age_days: Option<u64>,
}

impl RetentionPolicy {
    pub fn keeps_everything(&self) -> bool {
        self.keep_latest.is_none() && self.max_age_days.is_none()
    }
}

pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, manifest: &CacheManifest) -> PathBuf {
        self.root.join(&manifest.artifact_file_name)
    }

    /// Newest usable manifest whose fingerprint exactly matches.
    pub fn lookup(&self, fingerprint: &CacheFingerprint) -> Option<CacheManifest> {
        let found = self
            .entries()
            .into_iter()
            .find(|manifest| manifest.fingerprint.matches(fingerprint));
        match found {
            Some(ref manifest) => log::info!("[Cache] Hit: {} ({})", manifest.artifact_file_name, fingerprint),
            None => log::info!("[Cache] Miss: {}", fingerprint),
        }
        found
    }

    /// All readable manifests with an artifact present, newest first.
    /// Corrupt manifests and orphaned manifests are logged and skipped.
    pub fn entries(&self) -> Vec<CacheManifest> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("[Cache] Cannot read cache directory {}: {}", self.root.display(), e);
                }
                return Vec::new();
            }
        };

        let mut manifests: Vec<CacheManifest> = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(manifest::MANIFEST_EXTENSION) {
                continue;
            }
            match CacheManifest::read(&path) {
                Ok(manifest) => {
                    if self.artifact_path(&manifest).is_file() {
                        manifests.push(manifest);
                    } else {
                        log::warn!(
                            "[Cache] Skipping {}: artifact {} is missing",
                            path.display(),
                            manifest.artifact_file_name
                        );
                    }
                }
                Err(e) => log::warn!("[Cache] Skipping unreadable manifest: {}", e),
            }
        }

        manifests.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.artifact_file_name.cmp(&a.artifact_file_name))
        });
        manifests
    }

    /// Copy `artifact` into the store under a fresh id and write its manifest.
    pub fn register(&self, fingerprint: &CacheFingerprint, artifact: &Path) -> Result<CacheManifest, CacheError> {
        if !artifact.is_file() {
            return Err(CacheError::ArtifactMissing(artifact.to_path_buf()));
        }
        std::fs::create_dir_all(&self.root)?;

        let artifact_file_name = format!("img-{}.{}", uuid::Uuid::new_v4(), manifest::ARTIFACT_EXTENSION);
        let target = self.root.join(&artifact_file_name);

        // Copy under a temp name so a crash never leaves a partial img-*.bin
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::fs::copy(artifact, tmp.path())?;
        tmp.persist_noclobber(&target).map_err(|e| CacheError::Persist {
            path: target.clone(),
            reason: e.error.to_string(),
        })?;

        let manifest = CacheManifest {
            fingerprint: fingerprint.clone(),
            artifact_file_name,
            created_at: Utc::now(),
        };
        if let Err(e) = manifest.write_atomic(&self.root) {
            let _ = std::fs::remove_file(&target);
            return Err(e);
        }

        log::info!("[Cache] Registered {} for {}", manifest.artifact_file_name, fingerprint);
        Ok(manifest)
    }

    /// Delete entries the policy does not keep. Returns the removed manifests.
    pub fn prune(&self, policy: RetentionPolicy) -> Result<Vec<CacheManifest>, CacheError> {
        if policy.keeps_everything() {
            return Ok(Vec::new());
        }

        let cutoff = policy.max_age_days.and_then(age_cutoff);
        let mut removed = Vec::new();
        for (index, manifest) in self.entries().into_iter().enumerate() {
            let over_count = policy.keep_latest.map(|keep| index >= keep).unwrap_or(false);
            let too_old = cutoff.map(|cutoff| manifest.created_at < cutoff).unwrap_or(false);
            if !(over_count || too_old) {
                continue;
            }

            // Manifest first: an orphaned artifact is invisible, an orphaned manifest is skipped
            remove_if_present(&self.root.join(manifest.manifest_file_name()))?;
            remove_if_present(&self.artifact_path(&manifest))?;
            log::info!("[Cache] Pruned {}", manifest.artifact_file_name);
            removed.push(manifest);
        }
        Ok(removed)
    }
}

/// Oldest creation time an entry may have. `None` when the age reaches past
/// the representable range, in which case nothing is too old.
fn age_cutoff(days: u64) -> Option<DateTime<Utc>> {
    let age = i64::try_from(days).ok().and_then(Duration::try_days)?;
    Utc::now().checked_sub_signed(age)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
