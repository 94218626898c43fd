//! Sidecar manifest describing one cached artifact.

use super::fingerprint::CacheFingerprint;
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_EXTENSION: &str = "json";
pub const ARTIFACT_EXTENSION: &str = "bin";

/// Write-once record stored as `img-<id>.json` beside `img-<id>.bin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    #[serde(flatten)]
    pub fingerprint: CacheFingerprint,
    pub artifact_file_name: String,
    pub created_at: DateTime<Utc>,
}

impl CacheManifest {
    /// Manifest file name for an artifact file name.
    pub fn file_name_for(artifact_file_name: &str) -> String {
        let stem = Path::new(artifact_file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact_file_name.to_string());
        format!("{}.{}", stem, MANIFEST_EXTENSION)
    }

    pub fn manifest_file_name(&self) -> String {
        Self::file_name_for(&self.artifact_file_name)
    }

    pub fn read(path: &Path) -> Result<CacheManifest, CacheError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| CacheError::CorruptManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write into `dir` through a temp file + rename. Returns the final path.
    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf, CacheError> {
        let path = dir.join(self.manifest_file_name());
        let json = serde_json::to_vec_pretty(self).map_err(|e| CacheError::Persist {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&path).map_err(|e| CacheError::Persist {
            path: path.clone(),
            reason: e.error.to_string(),
        })?;
        Ok(path)
    }
}
