//! Progress/Log channel for image builds.
//!
//! Every component reports through the `ProgressChannel` trait. The production
//! implementation, `LogCollector`, appends each event to a single line-oriented
//! progress file that an external monitor tails.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator / TaskEngine workers / ToolRunner / log::* macros
//!     |
//! [LogCollector] (non-blocking, crossbeam unbounded channel)
//!     |
//! background thread
//!     +--> progress file (always written, flushed per line)
//!     +--> optional UI channel (try_send, dropped when full)
//! ```
//!
//! # Line format
//!
//! - free text: `[HH:MM:SS.mmm] message`
//! - progress:  `progress:<percentage>:<message>`
//!
//! A single writer's events keep their order; events from concurrent workers
//! interleave arbitrarily.

use crate::tasks::WorkStatus;
use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Log, Metadata, Record};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

static TIMESTAMP_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\d{2}:\d{2}:\d{2}\.\d{3}\] ").expect("static regex"));

/// One event on the progress channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Free-text log line
    Log(String),
    /// Overall build progress anchor
    Progress { percent: u8, message: String },
    /// A work item changed status
    ItemStatus { id: String, status: WorkStatus },
}

impl ProgressEvent {
    /// Render as one line of the progress file (without trailing newline).
    pub fn to_line(&self) -> String {
        match self {
            ProgressEvent::Progress { percent, message } => {
                format!("progress:{}:{}", percent.min(&100), single_line(message))
            }
            ProgressEvent::Log(message) => format!("[{}] {}", timestamp(), single_line(message)),
            ProgressEvent::ItemStatus { id, status } => {
                format!("[{}] item {} -> {}", timestamp(), single_line(id), status)
            }
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

/// Sink for progress events. Implementations must never block the caller
/// for long and must never fail.
pub trait ProgressChannel: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    /// Send a free-text line
    fn log(&self, message: &str) {
        self.emit(ProgressEvent::Log(message.to_string()));
    }

    /// Send a structured progress record
    fn progress(&self, percent: u8, message: &str) {
        self.emit(ProgressEvent::Progress {
            percent: percent.min(100),
            message: message.to_string(),
        });
    }
}

/// A parsed line of the progress file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    Text(String),
    Progress { percent: u8, message: String },
}

impl LogRecord {
    /// Classify a progress file line. A malformed `progress:` record is text.
    pub fn parse(line: &str) -> LogRecord {
        if let Some(rest) = line.strip_prefix("progress:") {
            if let Some((pct, message)) = rest.split_once(':') {
                if let Ok(percent) = pct.trim().parse::<u8>() {
                    if percent <= 100 {
                        return LogRecord::Progress {
                            percent,
                            message: message.to_string(),
                        };
                    }
                }
            }
        }
        LogRecord::Text(TIMESTAMP_PREFIX.replace(line, "").into_owned())
    }
}

/// Internal log line or special marker
enum LogMessage {
    Event(ProgressEvent),
    /// Flush marker; the background thread answers once everything before it is on disk
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// File-backed progress channel with a background writer thread.
#[derive(Clone)]
pub struct LogCollector {
    /// crossbeam unbounded for cross-runtime reliability
    tx: Sender<LogMessage>,
    path: PathBuf,
}

impl LogCollector {
    /// Create the collector and its writer thread. The progress file is
    /// opened in append mode so a monitor can keep tailing across runs.
    pub fn new(
        path: PathBuf,
        ui_tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
    ) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = unbounded::<LogMessage>();

        // OS thread rather than a tokio task so events sent from any runtime
        // (or none) still reach disk.
        std::thread::Builder::new()
            .name("progress-writer".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Event(event) => {
                            let line = format!("{}\n", event.to_line());
                            let _ = file.write_all(line.as_bytes());
                            let _ = file.flush();

                            if let Some(ref ui) = ui_tx {
                                let _ = ui.try_send(event);
                            }
                        }
                        LogMessage::Flush(ack) => {
                            let _ = file.flush();
                            let _ = file.sync_data();
                            let _ = ack.send(());
                        }
                    }
                }
            })?;

        Ok(LogCollector { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every event sent before this call has been written.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(LogMessage::Flush(ack_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        ack_rx
            .await
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Install this collector as the global `log` backend.
    pub fn init_global_logger(&self, level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(self.clone())).map(|()| log::set_max_level(level))
    }
}

impl ProgressChannel for LogCollector {
    fn emit(&self, event: ProgressEvent) {
        // Unbounded channel; only fails once the writer thread is gone
        let _ = self.tx.send(LogMessage::Event(event));
    }
}

/// Wires all log::info!(), log::warn!(), log::error!() calls into the progress file
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.emit(ProgressEvent::Log(format!("[{}] {}", record.level(), record.args())));
        }
    }

    fn flush(&self) {}
}

/// In-memory channel. Keeps every event in emission order.
#[derive(Default)]
pub struct MemoryChannel {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Free-text lines only
    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Log(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Progress percentages in emission order
    pub fn percentages(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl ProgressChannel for MemoryChannel {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Follows the progress file from a byte offset, the way a monitor tails it.
pub struct ProgressTail {
    file: Option<File>,
    offset: u64,
    partial: String,
}

impl ProgressTail {
    /// Start at the beginning of the file
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(ProgressTail {
            file: Some(File::open(path)?),
            offset: 0,
            partial: String::new(),
        })
    }

    /// Start at the current end of the file, skipping history
    pub fn open_at_end(path: &Path) -> io::Result<Self> {
        let mut tail = Self::open(path)?;
        if let Some(ref mut file) = tail.file {
            tail.offset = file.seek(SeekFrom::End(0))?;
        }
        Ok(tail)
    }

    /// Records completed since the previous poll. A trailing line without a
    /// newline is held back until it is finished.
    pub fn poll(&mut self) -> io::Result<Vec<LogRecord>> {
        let Some(ref mut file) = self.file else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = String::new();
        let read = file.read_to_string(&mut chunk)?;
        self.offset += read as u64;
        self.partial.push_str(&chunk);

        let mut records = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                records.push(LogRecord::parse(line));
            }
        }
        Ok(records)
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Release the file handle. Further polls return nothing.
    pub fn close(&mut self) {
        self.file = None;
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_round_trips_through_parser() {
        let line = ProgressEvent::Progress {
            percent: 40,
            message: "Resolving base image".to_string(),
        }
        .to_line();
        assert_eq!(line, "progress:40:Resolving base image");
        assert_eq!(
            LogRecord::parse(&line),
            LogRecord::Progress {
                percent: 40,
                message: "Resolving base image".to_string()
            }
        );
    }

    #[test]
    fn test_text_line_strips_timestamp() {
        let line = ProgressEvent::Log("hello: world".to_string()).to_line();
        assert_eq!(LogRecord::parse(&line), LogRecord::Text("hello: world".to_string()));
    }

    #[test]
    fn test_malformed_progress_is_text() {
        assert_eq!(
            LogRecord::parse("progress:abc:nope"),
            LogRecord::Text("progress:abc:nope".to_string())
        );
        assert_eq!(
            LogRecord::parse("progress:140:too much"),
            LogRecord::Text("progress:140:too much".to_string())
        );
    }

    #[test]
    fn test_multiline_messages_stay_on_one_line() {
        let line = ProgressEvent::Log("first\nsecond".to_string()).to_line();
        assert!(!line.contains('\n'));
    }

    #[tokio::test]
    async fn test_collector_writes_and_tail_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("progress.log");
        let collector = LogCollector::new(path.clone(), None).unwrap();
        let mut tail = ProgressTail::open(&path).unwrap();

        ProgressChannel::log(&collector, "starting");
        collector.progress(10, "Validating environment");
        collector.emit(ProgressEvent::ItemStatus {
            id: "usb0".to_string(),
            status: WorkStatus::Running,
        });
        collector.wait_for_empty().await.unwrap();

        let records = tail.poll().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], LogRecord::Text("starting".to_string()));
        assert_eq!(
            records[1],
            LogRecord::Progress {
                percent: 10,
                message: "Validating environment".to_string()
            }
        );
        assert_eq!(records[2], LogRecord::Text("item usb0 -> Running".to_string()));

        // Nothing new until more is written
        assert!(tail.poll().unwrap().is_empty());
        tail.close();
        ProgressChannel::log(&collector, "after close");
        collector.wait_for_empty().await.unwrap();
        assert!(tail.poll().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collector_forwards_to_ui_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (ui_tx, mut ui_rx) = tokio::sync::mpsc::channel(16);
        let collector = LogCollector::new(dir.path().join("p.log"), Some(ui_tx)).unwrap();

        collector.progress(55, "Capturing");
        collector.wait_for_empty().await.unwrap();

        assert_eq!(
            ui_rx.recv().await,
            Some(ProgressEvent::Progress {
                percent: 55,
                message: "Capturing".to_string()
            })
        );
    }

    #[test]
    fn test_memory_channel_keeps_order() {
        let channel = MemoryChannel::new();
        channel.progress(5, "a");
        channel.log("b");
        channel.progress(150, "c");
        assert_eq!(channel.percentages(), vec![5, 100]);
        assert_eq!(channel.lines(), vec!["b".to_string()]);
    }
}
