//! Task worker: drains `ready`, claims, analyzes, finalizes.
//!
//! One worker is one thread. Any number of workers may share a
//! [`TaskContext`]; the store claim is the only point where they contend.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use docflow_core::{DocumentRef, QueueEntry, Task, TaskId, TaskOutcome, TaskStatus};

use crate::analysis::{AnalysisRequest, Analyzer};
use crate::context::TaskContext;
use crate::documents::{DocumentError, DocumentStore, decode_text};
use crate::error::InfraError;
use crate::task_store::TaskStoreError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name, also used as the `worker` log field.
    pub name: String,
    pub dequeue_timeout: Duration,
    pub upload_poll_interval: Duration,
    pub upload_poll_attempts: u32,
    /// Pause after an infrastructure failure.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "docflow-worker".to_string(),
            dequeue_timeout: Duration::from_secs(10),
            upload_poll_interval: Duration::from_secs(2),
            upload_poll_attempts: 15,
            error_backoff: Duration::from_secs(3),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Longest time a claimed task can spend waiting for its upload.
    pub fn max_upload_wait(&self) -> Duration {
        self.upload_poll_interval
            .saturating_mul(self.upload_poll_attempts)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Stale entries and lost claim races.
    pub dropped: u64,
    /// Finalizes rejected because the claim had been reclaimed.
    pub fenced: u64,
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The dequeue wait elapsed.
    Idle,
    /// The entry no longer matched a pending task.
    Dropped(TaskId),
    /// The task reached this terminal status.
    Finished(TaskId, TaskStatus),
    /// The claim was reclaimed before this worker finalized.
    Fenced(TaskId),
}

/// Why executing a claimed task stopped short of an analysis result.
enum StepError {
    Failed(String),
    Infra(InfraError),
}

impl From<DocumentError> for StepError {
    fn from(e: DocumentError) -> Self {
        StepError::Failed(e.to_string())
    }
}

impl From<TaskStoreError> for StepError {
    fn from(e: TaskStoreError) -> Self {
        StepError::Infra(e.into())
    }
}

pub struct Worker {
    ctx: TaskContext,
    documents: Arc<dyn DocumentStore>,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(
        ctx: TaskContext,
        documents: Arc<dyn DocumentStore>,
        analyzer: Arc<dyn Analyzer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ctx,
            documents,
            analyzer,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        read_stats(&self.stats)
    }

    /// Run a single dequeue → claim → execute → finalize iteration.
    pub fn run_once(&self) -> Result<WorkOutcome, InfraError> {
        let Some(entry) = self.ctx.queue.dequeue_ready(self.config.dequeue_timeout)? else {
            return Ok(WorkOutcome::Idle);
        };
        let claimed_at = Utc::now();
        self.ctx.queue.move_to_processing(&entry, claimed_at)?;
        self.handle_entry(&entry, claimed_at)
    }

    /// Start the loop on a named thread.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.run_loop(shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn run_loop(self, shutdown_rx: mpsc::Receiver<()>) {
        let name = self.config.name.as_str();
        info!(worker = name, "Worker started, waiting for tasks");

        loop {
            if shutdown_signalled(&shutdown_rx) {
                break;
            }

            match self.run_once() {
                Ok(WorkOutcome::Idle) => continue,
                Ok(outcome) => debug!(worker = name, outcome = ?outcome, "Iteration finished"),
                Err(e) => {
                    error!(worker = name, error = %e, "Worker iteration failed, backing off");
                    if shutdown_rx.recv_timeout(self.config.error_backoff).is_ok() {
                        break;
                    }
                }
            }
        }

        info!(worker = name, "Worker stopped");
    }

    fn handle_entry(
        &self,
        entry: &QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<WorkOutcome, InfraError> {
        let name = self.config.name.as_str();
        let task_id = entry.task_id;

        let task = match self.ctx.store.get(task_id)? {
            Some(task) if task.status == TaskStatus::Pending => task,
            other => {
                debug!(
                    worker = name,
                    task_id = %task_id,
                    status = ?other.map(|t| t.status),
                    "Dropping stale queue entry"
                );
                return self.drop_entry(entry);
            }
        };

        let Some(token) = self.ctx.store.claim(task_id, claimed_at)? else {
            debug!(worker = name, task_id = %task_id, "Lost claim race");
            return self.drop_entry(entry);
        };

        info!(worker = name, task_id = %task_id, task_name = %task.name, "Processing task");

        let outcome = match self.execute(&task) {
            Ok(result) => TaskOutcome::Success(result),
            Err(StepError::Failed(message)) => {
                warn!(worker = name, task_id = %task_id, error = %message, "Task failed");
                TaskOutcome::failed(message)
            }
            Err(StepError::Infra(e)) => return Err(e),
        };
        let status = outcome.status();

        if !self.ctx.store.finalize(task_id, token, outcome)? {
            // The reaper reclaimed this task; its queue entry is no longer ours.
            warn!(worker = name, task_id = %task_id, "Claim was reclaimed, discarding result");
            self.record(|s| s.fenced += 1);
            return Ok(WorkOutcome::Fenced(task_id));
        }

        self.ctx.queue.acknowledge(entry)?;
        self.record(|s| {
            s.processed += 1;
            match status {
                TaskStatus::Success => s.succeeded += 1,
                _ => s.failed += 1,
            }
        });
        info!(worker = name, task_id = %task_id, status = %status, "Task finalized");
        Ok(WorkOutcome::Finished(task_id, status))
    }

    fn drop_entry(&self, entry: &QueueEntry) -> Result<WorkOutcome, InfraError> {
        self.ctx.queue.acknowledge(entry)?;
        self.record(|s| s.dropped += 1);
        Ok(WorkOutcome::Dropped(entry.task_id))
    }

    fn execute(&self, task: &Task) -> Result<serde_json::Value, StepError> {
        let text = self.resolve_document(task)?;
        let request = AnalysisRequest::new(text)
            .with_context(task.product.clone(), task.feature.clone());
        self.analyzer
            .analyze(&request)
            .map_err(|e| StepError::Failed(e.to_string()))
    }

    fn resolve_document(&self, task: &Task) -> Result<String, StepError> {
        let mut doc_ref = parse_doc(&task.doc)?;
        if doc_ref.is_pending() {
            doc_ref = parse_doc(&self.wait_for_upload(task.id)?)?;
        }

        match doc_ref {
            DocumentRef::Inline(text) => Ok(text),
            DocumentRef::Stored(locator) => {
                let bytes = self.documents.fetch(&locator)?;
                Ok(decode_text(&bytes))
            }
            DocumentRef::PendingUpload => Err(DocumentError::Pending {
                attempts: self.config.upload_poll_attempts,
            }
            .into()),
        }
    }

    /// Poll the store until the sentinel is replaced, up to the configured bound.
    fn wait_for_upload(&self, task_id: TaskId) -> Result<String, StepError> {
        let attempts = self.config.upload_poll_attempts;
        for attempt in 1..=attempts {
            thread::sleep(self.config.upload_poll_interval);
            let task = self.ctx.store.get(task_id)?.ok_or_else(|| {
                StepError::Failed(format!("task {task_id} was deleted while waiting for upload"))
            })?;
            if !matches!(DocumentRef::parse(&task.doc), Ok(DocumentRef::PendingUpload)) {
                debug!(task_id = %task_id, attempt, "Upload landed");
                return Ok(task.doc);
            }
            debug!(task_id = %task_id, attempt, attempts, "Document still pending upload");
        }
        Err(DocumentError::Pending { attempts }.into())
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

fn parse_doc(doc: &str) -> Result<DocumentRef, StepError> {
    DocumentRef::parse(doc).map_err(|e| DocumentError::InvalidPath(e.to_string()).into())
}

pub(crate) fn read_stats<T: Clone + Default>(stats: &Mutex<T>) -> T {
    stats.lock().map(|s| s.clone()).unwrap_or_default()
}

fn shutdown_signalled(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

/// Handle to a spawned worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Ask the loop to stop and wait for it. The loop notices between
    /// iterations, so this can take up to one dequeue timeout.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        read_stats(&self.stats)
    }
}
