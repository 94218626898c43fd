//! Run marker: the sentinel file that exists while a build is in progress.
//!
//! Its payload lets the next launch clean up what an interrupted run left
//! behind, but only its existence is load-bearing: an unreadable marker still
//! means "a run did not finish".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;

/// A tool process spawned during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedProcess {
    pub pid: u32,
    /// Seconds since the epoch; guards against PID reuse after a reboot
    #[serde(default)]
    pub start_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarker {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processes: Vec<RecordedProcess>,
    #[serde(default)]
    pub vm_name: Option<String>,
}

impl RunMarker {
    pub fn new(run_id: impl Into<String>) -> Self {
        RunMarker {
            run_id: run_id.into(),
            created_at: Utc::now(),
            processes: Vec::new(),
            vm_name: None,
        }
    }

    /// Write the marker atomically (temp file in the same directory, then rename).
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read a marker. `Ok(None)` when no marker exists; `Err` when one exists
    /// but cannot be parsed.
    pub fn read(path: &Path) -> io::Result<Option<RunMarker>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Delete the marker; a missing marker is not an error.
    pub fn remove(path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
