//! Reaper: returns abandoned `processing` claims to `ready`.
//!
//! A claim is abandoned when its queue timestamp is older than the
//! processing timeout. Reclaims are capped per task; past the cap the task is
//! failed instead, so a poison document cannot cycle forever.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use docflow_core::{QueueEntry, TaskId, TaskStatus};

use crate::context::TaskContext;
use crate::error::InfraError;
use crate::worker::read_stats;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub name: String,
    pub interval: Duration,
    /// Visibility timeout. Must exceed the worst-case processing time,
    /// upload wait and analysis retries included.
    pub processing_timeout: Duration,
    /// Reclaims allowed per task before it is failed instead.
    pub max_reclaims: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            name: "docflow-reaper".to_string(),
            interval: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(600),
            max_reclaims: 3,
        }
    }
}

/// Cumulative counters across scans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapStats {
    pub scans: u64,
    pub reclaimed: u64,
    pub abandoned: u64,
    pub requeued: u64,
    pub cleaned: u64,
    pub stamped: u64,
}

/// What a single scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale claims moved back to pending and re-enqueued.
    pub reclaimed: Vec<TaskId>,
    /// Stale claims past the reclaim cap, now failed.
    pub abandoned: Vec<TaskId>,
    /// Pending tasks whose only queue entry was stuck in `processing`.
    pub requeued: Vec<TaskId>,
    /// Entries dropped because their task is terminal or gone.
    pub cleaned: Vec<TaskId>,
    /// Entries found in `processing` without a claim time, stamped now.
    pub stamped: Vec<TaskId>,
}

pub struct Reaper {
    ctx: TaskContext,
    config: ReaperConfig,
    stats: Arc<Mutex<ReapStats>>,
}

impl Reaper {
    pub fn new(ctx: TaskContext, config: ReaperConfig) -> Self {
        Self {
            ctx,
            config,
            stats: Arc::new(Mutex::new(ReapStats::default())),
        }
    }

    pub fn stats(&self) -> ReapStats {
        read_stats(&self.stats)
    }

    /// Scan `processing` once, treating `now` as the current time.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<ReapReport, InfraError> {
        let timeout = TimeDelta::from_std(self.config.processing_timeout).unwrap_or(TimeDelta::MAX);
        let stale_before = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = ReapReport::default();

        for entry in self.ctx.queue.list_processing()? {
            let task_id = entry.task_id;
            let Some(claimed_at) = self.ctx.queue.claim_timestamp(task_id)? else {
                // Either acknowledged since the snapshot, or its consumer died
                // before stamping it. Only the latter gets a stamp.
                if self.ctx.queue.stamp_unclaimed(&entry, now)? {
                    warn!(task_id = %task_id, "Stamped processing entry that had no claim time");
                    report.stamped.push(task_id);
                }
                continue;
            };
            if claimed_at >= stale_before {
                continue;
            }
            self.reap_entry(&entry, stale_before, &mut report)?;
        }

        self.record(|s| {
            s.scans += 1;
            s.reclaimed += report.reclaimed.len() as u64;
            s.abandoned += report.abandoned.len() as u64;
            s.requeued += report.requeued.len() as u64;
            s.cleaned += report.cleaned.len() as u64;
            s.stamped += report.stamped.len() as u64;
        });
        Ok(report)
    }

    pub fn spawn(self) -> io::Result<ReaperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.run_loop(shutdown_rx))?;

        Ok(ReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn run_loop(self, shutdown_rx: mpsc::Receiver<()>) {
        let name = self.config.name.as_str();
        info!(
            reaper = name,
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.processing_timeout.as_secs(),
            "Reaper started"
        );

        loop {
            match self.run_once(Utc::now()) {
                Ok(report) if report == ReapReport::default() => {
                    debug!(reaper = name, "No stale claims")
                }
                Ok(report) => info!(
                    reaper = name,
                    reclaimed = ?report.reclaimed,
                    abandoned = ?report.abandoned,
                    requeued = ?report.requeued,
                    cleaned = ?report.cleaned,
                    stamped = ?report.stamped,
                    "Reaper scan finished"
                ),
                Err(e) => error!(reaper = name, error = %e, "Reaper scan failed"),
            }

            // Stop on an explicit shutdown or when the handle is gone.
            match shutdown_rx.recv_timeout(self.config.interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }

        info!(reaper = name, "Reaper stopped");
    }

    fn reap_entry(
        &self,
        entry: &QueueEntry,
        stale_before: DateTime<Utc>,
        report: &mut ReapReport,
    ) -> Result<(), InfraError> {
        let task_id = entry.task_id;
        let store = &self.ctx.store;
        let queue = &self.ctx.queue;

        let Some(task) = store.get(task_id)? else {
            queue.acknowledge(entry)?;
            report.cleaned.push(task_id);
            return Ok(());
        };

        if task.status == TaskStatus::Processing && task.retry_count >= self.config.max_reclaims {
            let message = format!(
                "task abandoned after {} reclaims: processing exceeded {}s",
                task.retry_count,
                self.config.processing_timeout.as_secs()
            );
            if store.abandon(task_id, stale_before, &message)? {
                queue.acknowledge(entry)?;
                warn!(task_id = %task_id, retry_count = task.retry_count, "Abandoned stuck task");
                report.abandoned.push(task_id);
                return Ok(());
            }
        } else if store.reclaim(task_id, stale_before)? {
            // Enqueue before acknowledging: a failure in between leaves a
            // duplicate, never a pending task with no entry at all.
            queue.enqueue_ready(&QueueEntry::new(task_id, task.name.clone()))?;
            queue.acknowledge(entry)?;
            warn!(
                task_id = %task_id,
                retry_count = task.retry_count + 1,
                "Reclaimed stale task"
            );
            report.reclaimed.push(task_id);
            return Ok(());
        }

        // Not reclaimable: the task moved on since the entry was stamped.
        match store.get(task_id)? {
            Some(task) if task.status == TaskStatus::Pending => {
                queue.enqueue_ready(&QueueEntry::from(&task))?;
                queue.acknowledge(entry)?;
                info!(task_id = %task_id, "Re-enqueued pending task with orphaned entry");
                report.requeued.push(task_id);
            }
            _ => {
                queue.acknowledge(entry)?;
                debug!(task_id = %task_id, "Cleared bookkeeping for finished task");
                report.cleaned.push(task_id);
            }
        }
        Ok(())
    }

    fn record(&self, f: impl FnOnce(&mut ReapStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ReapStats>>,
}

impl ReaperHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> ReapStats {
        read_stats(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use docflow_core::{NewTask, TaskOutcome};

    use crate::queue::testing::FlakyQueue;
    use crate::queue::{InMemoryWorkQueue, QueueError};
    use crate::task_store::InMemoryTaskStore;

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn reaper(ctx: &TaskContext, max_reclaims: u32) -> Reaper {
        Reaper::new(
            ctx.clone(),
            ReaperConfig {
                name: "test-reaper".to_string(),
                interval: Duration::from_millis(10),
                processing_timeout: TIMEOUT,
                max_reclaims,
            },
        )
    }

    /// Create a task and leave it claimed with no worker attached.
    fn orphan(ctx: &TaskContext, claimed_at: DateTime<Utc>) -> (TaskId, QueueEntry) {
        let task = ctx.store.create(NewTask::new("orphan", "doc")).unwrap();
        let entry = QueueEntry::from(&task);
        ctx.queue.move_to_processing(&entry, claimed_at).unwrap();
        ctx.store.claim(task.id, claimed_at).unwrap().unwrap();
        (task.id, entry)
    }

    fn ctx_with_queue() -> (TaskContext, Arc<InMemoryWorkQueue>) {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let ctx = TaskContext::new(Arc::new(InMemoryTaskStore::new()), queue.clone());
        (ctx, queue)
    }

    #[test]
    fn fresh_claims_are_left_alone() {
        let (ctx, _) = ctx_with_queue();
        let claimed_at = Utc::now();
        let (id, _) = orphan(&ctx, claimed_at);

        // Exactly at the threshold is not stale.
        let now = claimed_at + TimeDelta::from_std(TIMEOUT).unwrap();
        let report = reaper(&ctx, 3).run_once(now).unwrap();

        assert_eq!(report, ReapReport::default());
        assert_eq!(ctx.store.get(id).unwrap().unwrap().status, TaskStatus::Processing);
    }

    #[test]
    fn stale_claim_is_reclaimed_and_requeued() {
        let (ctx, queue) = ctx_with_queue();
        let claimed_at = Utc::now();
        let (id, entry) = orphan(&ctx, claimed_at);

        let now = claimed_at + TimeDelta::seconds(601);
        let reaper = reaper(&ctx, 3);
        let report = reaper.run_once(now).unwrap();

        assert_eq!(report.reclaimed, vec![id]);
        let task = ctx.store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(ctx.queue.list_processing().unwrap().is_empty());
        assert!(ctx.queue.claim_timestamp(id).unwrap().is_none());
        assert_eq!(queue.ready_entries().unwrap(), vec![entry]);
        assert_eq!(reaper.stats().reclaimed, 1);
    }

    #[test]
    fn claim_past_cap_is_abandoned() {
        let (ctx, queue) = ctx_with_queue();
        let reaper = reaper(&ctx, 1);
        let t0 = Utc::now();
        let (id, _) = orphan(&ctx, t0);

        let first = reaper.run_once(t0 + TimeDelta::seconds(601)).unwrap();
        assert_eq!(first.reclaimed, vec![id]);

        // A second worker claims the requeued task and also disappears.
        let entry = ctx.queue.dequeue_ready(Duration::ZERO).unwrap().unwrap();
        let t1 = t0 + TimeDelta::seconds(700);
        ctx.queue.move_to_processing(&entry, t1).unwrap();
        ctx.store.claim(id, t1).unwrap().unwrap();

        let second = reaper.run_once(t1 + TimeDelta::seconds(601)).unwrap();
        assert_eq!(second.abandoned, vec![id]);

        let task = ctx.store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert!(task.result.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("abandoned after 1 reclaims"));
        assert!(queue.ready_entries().unwrap().is_empty());
        assert!(ctx.queue.list_processing().unwrap().is_empty());
    }

    #[test]
    fn finished_task_bookkeeping_is_cleaned() {
        let (ctx, queue) = ctx_with_queue();
        let claimed_at = Utc::now();
        let task = ctx.store.create(NewTask::new("done", "doc")).unwrap();
        let entry = QueueEntry::from(&task);
        ctx.queue.move_to_processing(&entry, claimed_at).unwrap();
        let token = ctx.store.claim(task.id, claimed_at).unwrap().unwrap();
        ctx.store
            .finalize(task.id, token, TaskOutcome::Success(serde_json::json!({})))
            .unwrap();

        let report = reaper(&ctx, 3)
            .run_once(claimed_at + TimeDelta::seconds(601))
            .unwrap();

        assert_eq!(report.cleaned, vec![task.id]);
        assert!(ctx.queue.list_processing().unwrap().is_empty());
        assert!(queue.ready_entries().unwrap().is_empty());
        assert_eq!(ctx.store.get(task.id).unwrap().unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn pending_task_with_stuck_entry_is_requeued() {
        let (ctx, queue) = ctx_with_queue();
        let claimed_at = Utc::now();
        let task = ctx.store.create(NewTask::new("never claimed", "doc")).unwrap();
        let entry = QueueEntry::from(&task);
        ctx.queue.move_to_processing(&entry, claimed_at).unwrap();

        let report = reaper(&ctx, 3)
            .run_once(claimed_at + TimeDelta::seconds(601))
            .unwrap();

        assert_eq!(report.requeued, vec![task.id]);
        assert_eq!(queue.ready_entries().unwrap(), vec![entry]);
        assert_eq!(ctx.store.get(task.id).unwrap().unwrap().retry_count, 0);
    }

    #[test]
    fn deleted_task_entry_is_cleaned() {
        let (ctx, _) = ctx_with_queue();
        let claimed_at = Utc::now();
        let (id, _) = orphan(&ctx, claimed_at);
        ctx.store.delete(&[id]).unwrap();

        let report = reaper(&ctx, 3)
            .run_once(claimed_at + TimeDelta::seconds(601))
            .unwrap();
        assert_eq!(report.cleaned, vec![id]);
    }

    #[test]
    fn failed_requeue_keeps_the_entry_for_the_next_scan() {
        let queue = Arc::new(FlakyQueue::default());
        let ctx = TaskContext::new(Arc::new(InMemoryTaskStore::new()), queue.clone());
        let claimed_at = Utc::now();
        let (id, entry) = orphan(&ctx, claimed_at);
        let reaper = reaper(&ctx, 3);
        let now = claimed_at + TimeDelta::seconds(601);

        queue.fail_next_enqueues(1);
        assert!(matches!(
            reaper.run_once(now),
            Err(InfraError::Queue(QueueError::Unavailable(_)))
        ));

        // Reclaimed in the store, but the stale entry is still tracked.
        let task = ctx.store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(ctx.queue.list_processing().unwrap(), vec![entry.clone()]);

        let report = reaper.run_once(now).unwrap();
        assert_eq!(report.requeued, vec![id]);
        assert_eq!(queue.inner.ready_entries().unwrap(), vec![entry]);
        assert!(ctx.queue.list_processing().unwrap().is_empty());
        assert_eq!(ctx.store.get(id).unwrap().unwrap().retry_count, 1);
    }

    #[test]
    fn unstamped_entry_is_stamped_then_reaped_once_stale() {
        let (ctx, queue) = ctx_with_queue();
        let task = ctx.store.create(NewTask::new("unstamped", "doc")).unwrap();
        let entry = QueueEntry::from(&task);
        // Two copies in flight; acknowledging one drops the shared stamp.
        let t0 = Utc::now();
        ctx.queue.move_to_processing(&entry, t0).unwrap();
        ctx.queue.move_to_processing(&entry, t0).unwrap();
        ctx.queue.acknowledge(&entry).unwrap();
        assert!(ctx.queue.claim_timestamp(task.id).unwrap().is_none());

        let reaper = reaper(&ctx, 3);
        let first = reaper.run_once(t0).unwrap();
        assert_eq!(first.stamped, vec![task.id]);
        assert_eq!(ctx.queue.claim_timestamp(task.id).unwrap(), Some(t0));

        // Not stale yet at exactly the timeout, stale just after it.
        let at_threshold = t0 + TimeDelta::from_std(TIMEOUT).unwrap();
        assert_eq!(reaper.run_once(at_threshold).unwrap(), ReapReport::default());

        let report = reaper.run_once(at_threshold + TimeDelta::milliseconds(1)).unwrap();
        assert_eq!(report.requeued, vec![task.id]);
        assert_eq!(queue.ready_entries().unwrap(), vec![entry]);
        assert!(ctx.queue.list_processing().unwrap().is_empty());
        assert_eq!(reaper.stats().stamped, 1);
    }

    #[test]
    fn spawned_reaper_stops_on_shutdown() {
        let (ctx, _) = ctx_with_queue();
        let handle = reaper(&ctx, 3).spawn().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(handle.stats().scans >= 1);
        handle.shutdown();
    }
}
