//! Registry of monitored jobs.
//!
//! [`TaskRegistry`] owns the authoritative [`Job`] record for every
//! monitored job, the listeners observing it, and at most one attached
//! [`WatcherHandle`]. [`TaskRegistry::apply`] is the single mutation point
//! for job state; the poll path and the push path both go through it, so
//! the first terminal update wins no matter which path delivers it.

use std::collections::HashMap;

use advsec_core::error::CoreError;
use advsec_core::job::{ApplyOutcome, Job, JobKind, StatusUpdate};
use advsec_core::types::JobId;
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};

use crate::watcher::WatcherHandle;

/// A UI-side binding to one monitored job.
///
/// Listeners see the latest [`Job`] snapshot (last-value-wins). Clone the
/// receiver via [`listener`](Self::listener) for additional listeners.
#[derive(Debug, Clone)]
pub struct Subscription {
    job_id: JobId,
    rx: watch::Receiver<Job>,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The latest known state of the job.
    pub fn current(&self) -> Job {
        self.rx.borrow().clone()
    }

    /// An additional listener on the same job.
    pub fn listener(&self) -> watch::Receiver<Job> {
        self.rx.clone()
    }

    /// Wait for the next change. Returns `None` once the registry entry is
    /// gone (cancelled or unregistered).
    pub async fn changed(&mut self) -> Option<Job> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the job is terminal.
    ///
    /// If the entry is dropped first (user cancellation) the last known,
    /// non-terminal state is returned.
    pub async fn wait_terminal(&mut self) -> Job {
        loop {
            {
                let job = self.rx.borrow_and_update();
                if job.is_terminal() {
                    return job.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

/// Internal bookkeeping for one monitored job.
struct Entry {
    /// Holds the authoritative job record; receivers are the listeners.
    tx: watch::Sender<Job>,
    watcher: Option<WatcherHandle>,
    /// Whether the terminal outcome has been seen by the user.
    acknowledged: bool,
}

impl Entry {
    fn is_terminal(&self) -> bool {
        self.tx.borrow().is_terminal()
    }
}

/// Maps job ids to their record, listeners and watcher.
///
/// Thread-safe via an interior `RwLock`; designed to be wrapped in `Arc`
/// and shared between the watchers, the dispatcher and the UI layer.
pub struct TaskRegistry {
    entries: RwLock<HashMap<JobId, Entry>>,
    /// Receives each job exactly once, when it first turns terminal.
    terminal_tx: Option<mpsc::UnboundedSender<Job>>,
}

impl TaskRegistry {
    /// Create an empty registry that does not report terminal transitions.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            terminal_tx: None,
        }
    }

    /// Create an empty registry that sends every job on `terminal_tx` the
    /// moment it first becomes terminal.
    pub fn with_terminal_sink(terminal_tx: mpsc::UnboundedSender<Job>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            terminal_tx: Some(terminal_tx),
        }
    }

    /// Start monitoring a job.
    ///
    /// Fails with [`CoreError::Conflict`] if a non-terminal entry already
    /// exists for `job_id`. A terminal entry for the same id is replaced.
    pub async fn register(&self, job_id: &str, kind: JobKind) -> Result<Subscription, CoreError> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(job_id) {
            if !existing.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "Job {job_id} is already being monitored"
                )));
            }
        }

        let (tx, rx) = watch::channel(Job::new(job_id, kind));
        entries.insert(
            job_id.to_string(),
            Entry {
                tx,
                watcher: None,
                acknowledged: false,
            },
        );
        tracing::debug!(job_id, kind = %kind, "Job registered");

        Ok(Subscription {
            job_id: job_id.to_string(),
            rx,
        })
    }

    /// Attach the polling watcher for a registered job.
    ///
    /// If the job already turned terminal (a push event beat the watcher's
    /// start), the handle is stopped immediately instead.
    pub async fn attach_watcher(&self, job_id: &str, handle: WatcherHandle) -> Result<(), CoreError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(job_id) else {
            handle.stop();
            return Err(CoreError::NotFound(job_id.to_string()));
        };

        if entry.is_terminal() {
            handle.stop();
            return Ok(());
        }
        if entry.watcher.as_ref().is_some_and(|w| !w.is_stopped()) {
            handle.stop();
            return Err(CoreError::Conflict(format!(
                "Job {job_id} already has an active watcher"
            )));
        }

        entry.watcher = Some(handle);
        Ok(())
    }

    /// Apply an update to a monitored job.
    ///
    /// Returns `None` when the job is not monitored (never registered,
    /// cancelled or unregistered). On the first terminal transition the
    /// attached watcher is stopped and the job is emitted on the terminal
    /// sink; later updates return [`ApplyOutcome::Ignored`].
    pub async fn apply(&self, job_id: &str, update: StatusUpdate) -> Option<ApplyOutcome> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(job_id)?;

        let mut outcome = ApplyOutcome::Ignored;
        entry.tx.send_if_modified(|job| {
            outcome = job.apply(update);
            outcome != ApplyOutcome::Ignored
        });

        if outcome == ApplyOutcome::Terminal {
            if let Some(watcher) = entry.watcher.take() {
                watcher.stop();
            }
            let job = entry.tx.borrow().clone();
            tracing::info!(
                job_id,
                status = ?job.status,
                "Job reached terminal state",
            );
            if let Some(terminal_tx) = &self.terminal_tx {
                let _ = terminal_tx.send(job);
            }
        }

        Some(outcome)
    }

    /// Attach a fetched result artifact to a terminal job.
    ///
    /// Returns `false` if the job is gone or not terminal.
    pub async fn attach_result(&self, job_id: &str, result: Value) -> bool {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(job_id) else {
            return false;
        };
        entry.tx.send_if_modified(|job| {
            if !job.is_terminal() {
                return false;
            }
            job.result = Some(result);
            true
        })
    }

    /// Record that the result artifact of a terminal job could not be
    /// fetched.
    ///
    /// Returns `false` if the job is gone or not terminal.
    pub async fn attach_result_error(&self, job_id: &str, error: impl Into<String>) -> bool {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(job_id) else {
            return false;
        };
        let error = error.into();
        entry.tx.send_if_modified(|job| {
            if !job.is_terminal() {
                return false;
            }
            job.result_error = Some(error);
            true
        })
    }

    /// Snapshot of one job.
    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.entries
            .read()
            .await
            .get(job_id)
            .map(|entry| entry.tx.borrow().clone())
    }

    /// Snapshot of every monitored job, oldest submission first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.tx.borrow().clone())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        jobs
    }

    /// Whether a non-terminal entry exists for `job_id`.
    pub async fn is_active(&self, job_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(job_id)
            .is_some_and(|entry| !entry.is_terminal())
    }

    /// Number of jobs still being monitored.
    pub async fn active_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_terminal())
            .count()
    }

    /// Remove a terminal job.
    ///
    /// Fails with [`CoreError::Conflict`] while the job is still active; use
    /// [`cancel`](Self::cancel) to stop monitoring an active job.
    pub async fn unregister(&self, job_id: &str) -> Result<Job, CoreError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get(job_id) else {
            return Err(CoreError::NotFound(job_id.to_string()));
        };
        if !entry.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "Job {job_id} is still active; cancel it instead"
            )));
        }
        let entry = entries
            .remove(job_id)
            .ok_or_else(|| CoreError::NotFound(job_id.to_string()))?;
        let job = entry.tx.borrow().clone();
        Ok(job)
    }

    /// Stop monitoring a job on user request.
    ///
    /// Stops the watcher and drops the entry, leaving the job's last known
    /// state untouched. Returns that state, or `None` if not monitored.
    pub async fn cancel(&self, job_id: &str) -> Option<Job> {
        let entry = self.entries.write().await.remove(job_id)?;
        if let Some(watcher) = &entry.watcher {
            watcher.stop();
        }
        let job = entry.tx.borrow().clone();
        tracing::info!(job_id, status = ?job.status, "Job monitoring cancelled");
        Some(job)
    }

    /// Terminal jobs whose outcome has not been acknowledged yet.
    ///
    /// Backs the aggregated completion indicator shown across views.
    pub async fn notifications(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.acknowledged && entry.is_terminal())
            .map(|entry| entry.tx.borrow().clone())
            .collect();
        jobs.sort_by(|a, b| a.last_updated_at.cmp(&b.last_updated_at));
        jobs
    }

    /// Mark a terminal job's outcome as seen.
    ///
    /// Returns `false` if the job is unknown or not yet terminal.
    pub async fn acknowledge(&self, job_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(job_id) {
            Some(entry) if entry.is_terminal() => {
                entry.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Stop every attached watcher. Used at shutdown.
    pub async fn stop_all(&self) {
        let mut entries = self.entries.write().await;
        let mut stopped = 0usize;
        for entry in entries.values_mut() {
            if let Some(watcher) = entry.watcher.take() {
                watcher.stop();
                stopped += 1;
            }
        }
        tracing::info!(count = stopped, "Stopped all job watchers");
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
