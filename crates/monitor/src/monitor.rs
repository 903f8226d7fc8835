//! Console-facing facade over the monitoring core.
//!
//! [`TaskMonitor`] is created once at startup and shared as an `Arc`. It
//! owns the [`TaskRegistry`], the push [`EventDispatcher`], the lazily
//! created [`ConnectionManager`] and a background worker that fetches the
//! result artifact of every completed job exactly once.
//!
//! Submitting a job goes: submission -> register -> connect -> subscribe
//! interest -> start watcher. A submission failure is returned to the caller
//! and the job never enters the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use advsec_core::error::CoreError;
use advsec_core::job::{AbortReason, Job, JobKind, JobStatus, StatusUpdate};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, BackendApi, PollError, StatusSource};
use crate::client::PushClient;
use crate::config::MonitorConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatcher::EventDispatcher;
use crate::registry::{Subscription, TaskRegistry};
use crate::watcher::JobWatcher;

/// How long [`TaskMonitor::shutdown`] waits for the result worker.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Most recent fetched result per job kind.
type ResultCache = RwLock<HashMap<JobKind, Value>>;

/// Shared handle to the monitoring core.
pub struct TaskMonitor {
    config: MonitorConfig,
    api: Arc<BackendApi>,
    source: Arc<dyn StatusSource>,
    registry: Arc<TaskRegistry>,
    dispatcher: Arc<EventDispatcher>,
    /// Created on first use; at most one per monitor.
    connection: Arc<OnceLock<ConnectionManager>>,
    last_results: Arc<ResultCache>,
    result_worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl TaskMonitor {
    /// Build the HTTP client from `config` and start the monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: MonitorConfig) -> Result<Arc<Self>, MonitorError> {
        let api = Arc::new(
            BackendApi::new(config.api_url.clone(), config.request_timeout)
                .map_err(MonitorError::Setup)?,
        );
        let source: Arc<dyn StatusSource> = api.clone();
        Ok(Self::with_source(config, api, source))
    }

    /// Start a monitor whose watchers poll `source` instead of `api`.
    ///
    /// Submission and health checks still go through `api`.
    pub fn with_source(
        config: MonitorConfig,
        api: Arc<BackendApi>,
        source: Arc<dyn StatusSource>,
    ) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(TaskRegistry::with_terminal_sink(terminal_tx));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
        let connection = Arc::new(OnceLock::new());
        let last_results = Arc::new(ResultCache::default());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_result_worker(
            terminal_rx,
            Arc::clone(&source),
            Arc::clone(&registry),
            Arc::clone(&connection),
            Arc::clone(&last_results),
            cancel.clone(),
        ));

        tracing::info!(
            api_url = %config.api_url,
            push = config.ws_url.is_some(),
            "Task monitor started",
        );

        Arc::new(Self {
            config,
            api,
            source,
            registry,
            dispatcher,
            connection,
            last_results,
            result_worker: Mutex::new(Some(worker)),
            cancel,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Submit a job and start monitoring it.
    pub async fn submit(&self, kind: JobKind, params: &Value) -> Result<Subscription, MonitorError> {
        self.ensure_running()?;
        let job_id = self
            .api
            .submit(kind, params)
            .await
            .map_err(MonitorError::Submission)?;
        self.watch(&job_id, kind).await
    }

    /// Start monitoring a job that was submitted elsewhere.
    pub async fn watch(&self, job_id: &str, kind: JobKind) -> Result<Subscription, MonitorError> {
        self.ensure_running()?;
        let subscription = self.registry.register(job_id, kind).await?;

        if let Some(connection) = self.push_channel() {
            connection.connect();
            connection.subscribe(job_id);
        }

        let handle = JobWatcher::new(
            job_id,
            kind,
            Arc::clone(&self.source),
            Arc::clone(&self.registry),
            self.config.watcher,
        )
        .start();
        self.registry.attach_watcher(job_id, handle).await?;

        tracing::info!(job_id, kind = %kind, "Monitoring job");
        Ok(subscription)
    }

    /// Stop monitoring a job on user request.
    ///
    /// The job's last known state is returned unchanged; no terminal
    /// transition is recorded.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, MonitorError> {
        let job = self
            .registry
            .cancel(job_id)
            .await
            .ok_or_else(|| CoreError::NotFound(job_id.to_string()))?;
        if let Some(connection) = self.connection.get() {
            connection.unsubscribe(job_id);
        }
        Ok(job)
    }

    /// Re-poll a job once, outside the watcher's schedule.
    ///
    /// The response goes through the same merge rules as a watcher tick. A
    /// transient failure is returned without touching the job.
    pub async fn refresh(&self, job_id: &str) -> Result<Job, MonitorError> {
        let job = self
            .registry
            .get(job_id)
            .await
            .ok_or_else(|| CoreError::NotFound(job_id.to_string()))?;
        if job.is_terminal() {
            return Ok(job);
        }

        let update = match self.source.fetch_status(job.kind, job_id).await {
            Ok(report) => report.into_update(),
            Err(PollError::NotFound) => StatusUpdate::aborted(AbortReason::StatusUnsupported),
            Err(e) => return Err(e.into()),
        };
        self.registry.apply(job_id, update).await;

        self.registry
            .get(job_id)
            .await
            .ok_or_else(|| MonitorError::from(CoreError::NotFound(job_id.to_string())))
    }

    /// Remove a terminal job from the registry.
    pub async fn dismiss(&self, job_id: &str) -> Result<Job, MonitorError> {
        Ok(self.registry.unregister(job_id).await?)
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.registry.get(job_id).await
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.registry.list().await
    }

    /// Terminal jobs the user has not acknowledged yet.
    pub async fn notifications(&self) -> Vec<Job> {
        self.registry.notifications().await
    }

    pub async fn acknowledge(&self, job_id: &str) -> bool {
        self.registry.acknowledge(job_id).await
    }

    /// The most recent result fetched for a job kind.
    pub async fn last_result(&self, kind: JobKind) -> Option<Value> {
        self.last_results.read().await.get(&kind).cloned()
    }

    /// State of the push channel; `Disconnected` when push is disabled or
    /// not yet started.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .get()
            .map_or(ConnectionState::Disconnected, ConnectionManager::state)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Check the backend's health endpoint.
    pub async fn health(&self) -> Result<Value, MonitorError> {
        self.api.health().await.map_err(MonitorError::Request)
    }

    /// Stop every watcher and close the push channel.
    ///
    /// Runs once; later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down task monitor");

        self.registry.stop_all().await;
        if let Some(connection) = self.connection.get() {
            connection.close().await;
        }

        self.cancel.cancel();
        let worker = self
            .result_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, worker).await;
        }

        tracing::info!("Task monitor shut down complete");
    }

    // ---- private helpers ----

    fn ensure_running(&self) -> Result<(), MonitorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MonitorError::ShutDown);
        }
        Ok(())
    }

    /// The push channel manager, created on first use. `None` when push
    /// delivery is disabled.
    fn push_channel(&self) -> Option<&ConnectionManager> {
        let ws_url = self.config.ws_url.as_ref()?;
        Some(self.connection.get_or_init(|| {
            ConnectionManager::new(
                PushClient::new(ws_url.clone()),
                self.config.reconnect,
                Arc::clone(&self.dispatcher),
            )
        }))
    }
}

/// Consume terminal jobs from the registry and fetch completed results.
async fn run_result_worker(
    mut terminal_rx: mpsc::UnboundedReceiver<Job>,
    source: Arc<dyn StatusSource>,
    registry: Arc<TaskRegistry>,
    connection: Arc<OnceLock<ConnectionManager>>,
    last_results: Arc<ResultCache>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = terminal_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // The id may already be watched again under a fresh registration.
        if !registry.is_active(&job.job_id).await {
            if let Some(connection) = connection.get() {
                connection.unsubscribe(&job.job_id);
            }
        }

        if job.status != JobStatus::Completed {
            continue;
        }
        let Some(result_ref) = job.result_ref.as_deref() else {
            continue;
        };

        match source.fetch_result(job.kind, result_ref).await {
            Ok(result) => {
                registry.attach_result(&job.job_id, result.clone()).await;
                last_results.write().await.insert(job.kind, result);
                tracing::info!(job_id = %job.job_id, result_ref, "Fetched job result");
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    result_ref,
                    error = %e,
                    "Failed to fetch job result",
                );
                registry.attach_result_error(&job.job_id, e.to_string()).await;
            }
        }
    }
    tracing::debug!("Result worker exited");
}

/// Errors returned by [`TaskMonitor`].
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The backend refused or failed the job submission.
    #[error("Failed to submit job: {0}")]
    Submission(ApiError),

    /// The HTTP client could not be constructed.
    #[error("Failed to set up backend client: {0}")]
    Setup(ApiError),

    #[error("Backend request failed: {0}")]
    Request(ApiError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Status poll failed: {0}")]
    Poll(#[from] PollError),

    #[error("Task monitor is shut down")]
    ShutDown,
}
