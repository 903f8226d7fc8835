//! Per-job polling state machine.
//!
//! A [`JobWatcher`] advances one job from submission to a terminal state by
//! polling its status endpoint on a fixed interval, independently of
//! whether push delivery ever arrives. Every observation is applied through
//! [`TaskRegistry::apply`], which is where poll and push results converge.
//!
//! ```text
//! Idle --start--> Polling --+--> Completed
//!                           +--> Failed
//!                           +--> Aborted   (404, or max consecutive errors)
//!                           +--> Stopped   (user cancellation)
//! ```

use std::sync::Arc;
use std::time::Duration;

use advsec_core::job::{AbortReason, ApplyOutcome, JobKind, JobStatus, StatusUpdate};
use advsec_core::types::JobId;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::{PollError, StatusReport, StatusSource};
use crate::registry::TaskRegistry;

/// Default interval between status requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default number of consecutive transient failures tolerated.
pub const DEFAULT_MAX_ERRORS: u32 = 5;

/// Lifecycle of a [`JobWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Polling,
    Completed,
    Failed,
    Aborted,
    /// Stopped by the user before any terminal state was observed.
    Stopped,
}

impl WatcherState {
    pub fn is_finished(self) -> bool {
        !matches!(self, WatcherState::Idle | WatcherState::Polling)
    }

    fn from_job_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => WatcherState::Completed,
            JobStatus::Failed => WatcherState::Failed,
            JobStatus::Aborted => WatcherState::Aborted,
            JobStatus::Submitted | JobStatus::Running => WatcherState::Stopped,
        }
    }
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// Consecutive transient failures after which monitoring is abandoned.
    pub max_errors: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }
}

/// Cancellable handle to a watcher's timer.
///
/// Cheap to clone; every clone controls the same watcher.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    cancel: CancellationToken,
    state: watch::Receiver<WatcherState>,
}

impl WatcherHandle {
    /// Stop polling. Idempotent and valid from any state; the job's last
    /// known state is left untouched and an in-flight response is discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Wait until the watcher has left `Idle`/`Polling`.
    pub async fn finished(&self) -> WatcherState {
        let mut state = self.state.clone();
        let finished = state.wait_for(|s| s.is_finished()).await.map(|s| *s);
        finished.unwrap_or_else(|_| *state.borrow())
    }
}

/// What the state machine decided for one poll result.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// Apply this update through the registry.
    Apply(StatusUpdate),
    /// Transient failure within budget; try again on the next tick.
    Retry,
}

/// The polling state machine for one job.
pub struct JobWatcher {
    job_id: JobId,
    kind: JobKind,
    source: Arc<dyn StatusSource>,
    registry: Arc<TaskRegistry>,
    config: WatcherConfig,
    consecutive_errors: u32,
    cancel: CancellationToken,
    state_tx: watch::Sender<WatcherState>,
}

impl JobWatcher {
    /// Create a watcher in the `Idle` state.
    pub fn new(
        job_id: impl Into<JobId>,
        kind: JobKind,
        source: Arc<dyn StatusSource>,
        registry: Arc<TaskRegistry>,
        config: WatcherConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatcherState::Idle);
        Self {
            job_id: job_id.into(),
            kind,
            source,
            registry,
            config,
            consecutive_errors: 0,
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            cancel: self.cancel.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Transition to `Polling` and spawn the poll loop.
    ///
    /// The first status request fires one interval after start.
    pub fn start(self) -> WatcherHandle {
        let handle = self.handle();
        self.state_tx.send_replace(WatcherState::Polling);
        tracing::debug!(
            job_id = %self.job_id,
            kind = %self.kind,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Job watcher started",
        );
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let final_state = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break self.state_after_stop().await,
                _ = ticker.tick() => {}
            }

            let result = self.source.fetch_status(self.kind, &self.job_id).await;

            if self.cancel.is_cancelled() {
                tracing::debug!(job_id = %self.job_id, "Discarding in-flight poll result");
                break self.state_after_stop().await;
            }

            let update = match self.evaluate(result) {
                Step::Retry => continue,
                Step::Apply(update) => update,
            };
            let status = update.status;

            match self.registry.apply(&self.job_id, update).await {
                Some(ApplyOutcome::Progressed) => continue,
                Some(ApplyOutcome::Terminal) => break WatcherState::from_job_status(status),
                Some(ApplyOutcome::Ignored) => break self.state_after_stop().await,
                None => {
                    tracing::debug!(job_id = %self.job_id, "Job no longer monitored");
                    break WatcherState::Stopped;
                }
            }
        };

        self.cancel.cancel();
        self.state_tx.send_replace(final_state);
        tracing::debug!(job_id = %self.job_id, state = ?final_state, "Job watcher finished");
    }

    /// Decide what one poll result means for the job.
    fn evaluate(&mut self, result: Result<StatusReport, PollError>) -> Step {
        match result {
            Ok(report) => {
                self.consecutive_errors = 0;
                Step::Apply(report.into_update())
            }
            Err(PollError::NotFound) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    kind = %self.kind,
                    "Status endpoint not found, abandoning monitoring",
                );
                Step::Apply(StatusUpdate::aborted(AbortReason::StatusUnsupported))
            }
            Err(PollError::Transient(error)) => {
                self.consecutive_errors += 1;
                tracing::warn!(
                    job_id = %self.job_id,
                    error = %error,
                    consecutive_errors = self.consecutive_errors,
                    max_errors = self.config.max_errors,
                    "Status poll failed",
                );
                if self.consecutive_errors >= self.config.max_errors {
                    Step::Apply(StatusUpdate::aborted(AbortReason::MonitoringLost))
                } else {
                    Step::Retry
                }
            }
        }
    }

    /// Final state when the loop ends without this watcher making a
    /// terminal transition: mirror the job's terminal status if another
    /// path settled it, otherwise `Stopped`.
    async fn state_after_stop(&self) -> WatcherState {
        match self.registry.get(&self.job_id).await {
            Some(job) => WatcherState::from_job_status(job.status),
            None => WatcherState::Stopped,
        }
    }
}
