//! Work item queue and bounded-concurrency task engine.
//!
//! The engine is task-type agnostic: callers hand it a batch of `WorkItem`s and
//! a `HandlerTable` mapping each `TaskType` to a handler. Driver downloads and
//! USB provisioning run through the same code path with different tables.
//!
//! A failing item never cancels its siblings; the batch always runs to
//! completion and the caller applies a `BatchPolicy` to the results.

pub mod handlers;

use crate::error::TaskItemError;
use crate::log_collector::{ProgressChannel, ProgressEvent};
use crate::models::VolumeSet;
use crate::recovery::CancelSignal;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub use handlers::{FetchHandler, ProvisionHandler};

/// Kind of work; selects the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    DriverDownload,
    AppDownload,
    UpdateDownload,
    DeviceProvision,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::DriverDownload => "driver-download",
            TaskType::AppDownload => "app-download",
            TaskType::UpdateDownload => "update-download",
            TaskType::DeviceProvision => "device-provision",
        };
        f.write_str(name)
    }
}

/// Inputs handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskArguments {
    /// Download `identifier` into `destination`
    Fetch { identifier: String, destination: PathBuf },
    /// Partition `device_id` and copy `artifact` onto it
    Provision { device_id: String, artifact: PathBuf },
}

/// What a successful handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    Fetched(PathBuf),
    Provisioned(VolumeSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One unit of parallel work. Only the worker that picked it up mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Unique within a batch
    pub id: String,
    pub task_type: TaskType,
    pub arguments: TaskArguments,
    pub status: WorkStatus,
    pub result: Option<TaskPayload>,
    pub error: Option<TaskItemError>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, task_type: TaskType, arguments: TaskArguments) -> Self {
        WorkItem {
            id: id.into(),
            task_type,
            arguments,
            status: WorkStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == WorkStatus::Succeeded
    }

    /// `id: error` summary for failed items
    pub fn failure_summary(&self) -> Option<String> {
        self.error.as_ref().map(|e| format!("{}: {}", self.id, e))
    }
}

/// Executes the work for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, arguments: &TaskArguments) -> Result<TaskPayload, TaskItemError>;
}

/// Handler lookup keyed by task type.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }
}

/// How a stage judges a finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Any failed item fails the stage
    AllMustSucceed,
    /// The stage fails only if no item succeeded
    AnySuccess,
}

impl BatchPolicy {
    /// Ok when the batch satisfies the policy; otherwise the failure summaries.
    pub fn evaluate(&self, items: &[WorkItem]) -> Result<(), Vec<String>> {
        let failed: Vec<String> = items.iter().filter_map(|i| i.failure_summary()).collect();
        let ok = match self {
            BatchPolicy::AllMustSucceed => failed.is_empty(),
            BatchPolicy::AnySuccess => items.is_empty() || items.iter().any(|i| i.succeeded()),
        };
        if ok {
            Ok(())
        } else {
            Err(failed)
        }
    }
}

/// Bounded worker pool over a batch of work items.
#[derive(Clone)]
pub struct TaskEngine {
    progress: Arc<dyn ProgressChannel>,
    cancel: CancelSignal,
}

impl TaskEngine {
    pub fn new(progress: Arc<dyn ProgressChannel>, cancel: CancelSignal) -> Self {
        TaskEngine { progress, cancel }
    }

    /// Run every item to a terminal status and return them in input order.
    ///
    /// The pool has `min(max_concurrency, items.len())` workers; a
    /// `max_concurrency` of 0 gives every item its own worker. Items still
    /// pending when cancellation is observed are failed without running.
    pub async fn run_batch(
        &self,
        items: Vec<WorkItem>,
        handlers: &HandlerTable,
        max_concurrency: usize,
    ) -> Vec<WorkItem> {
        let total = items.len();
        if total == 0 {
            return items;
        }
        let workers = if max_concurrency == 0 {
            total
        } else {
            max_concurrency.min(total)
        };

        log::info!("[Tasks] Running batch of {} item(s) on {} worker(s)", total, workers);

        let queue: Arc<Mutex<VecDeque<(usize, WorkItem)>>> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));

        let mut pool = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let handlers = handlers.clone();
            let progress = Arc::clone(&self.progress);
            let cancel = self.cancel.clone();
            pool.push(tokio::spawn(async move {
                let mut done = Vec::new();
                loop {
                    let next = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => None,
                    };
                    let Some((index, mut item)) = next else {
                        break;
                    };
                    run_item(&mut item, &handlers, progress.as_ref(), &cancel).await;
                    done.push((index, item));
                }
                done
            }));
        }

        let mut finished: Vec<(usize, WorkItem)> = Vec::with_capacity(total);
        for joined in futures::future::join_all(pool).await {
            match joined {
                Ok(done) => finished.extend(done),
                Err(e) => log::error!("[Tasks] Worker terminated abnormally: {}", e),
            }
        }

        finished.sort_by_key(|(index, _)| *index);
        let results: Vec<WorkItem> = finished.into_iter().map(|(_, item)| item).collect();

        let failed = results.iter().filter(|i| !i.succeeded()).count();
        log::info!(
            "[Tasks] Batch complete: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        results
    }
}

async fn run_item(
    item: &mut WorkItem,
    handlers: &HandlerTable,
    progress: &dyn ProgressChannel,
    cancel: &CancelSignal,
) {
    if cancel.is_cancelled() {
        finish(item, Err(TaskItemError::Cancelled), progress);
        return;
    }

    let Some(handler) = handlers.get(item.task_type) else {
        let missing = TaskItemError::NoHandler(item.task_type.to_string());
        finish(item, Err(missing), progress);
        return;
    };

    transition(item, WorkStatus::Running, progress);

    // The handler runs in its own task so a panic is contained to this item
    let arguments = item.arguments.clone();
    let outcome = tokio::spawn(async move { handler.handle(&arguments).await })
        .await
        .unwrap_or_else(|e| Err(TaskItemError::Panicked(e.to_string())));

    finish(item, outcome, progress);
}

fn finish(item: &mut WorkItem, outcome: Result<TaskPayload, TaskItemError>, progress: &dyn ProgressChannel) {
    match outcome {
        Ok(payload) => {
            item.result = Some(payload);
            item.error = None;
            transition(item, WorkStatus::Succeeded, progress);
        }
        Err(e) => {
            log::warn!("[Tasks] {} ({}) failed: {}", item.id, item.task_type, e);
            item.result = None;
            item.error = Some(e);
            transition(item, WorkStatus::Failed, progress);
        }
    }
}

fn transition(item: &mut WorkItem, status: WorkStatus, progress: &dyn ProgressChannel) {
    item.status = status;
    progress.emit(ProgressEvent::ItemStatus {
        id: item.id.clone(),
        status,
    });
}
