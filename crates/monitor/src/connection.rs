//! Process-wide push channel manager.
//!
//! [`ConnectionManager`] owns the single WebSocket connection to the
//! backend. [`connect`](ConnectionManager::connect) spawns one long-lived
//! task (connect -> session -> reconnect) and is a no-op while that task is
//! alive, so re-entrant calls never start a second attempt.
//!
//! The manager also keeps the set of job ids the console is interested in.
//! After every (re)connection the task re-sends a subscribe envelope for
//! each of them before the state flips to [`ConnectionState::Connected`].
//!
//! Every inbound frame is handed to the [`EventDispatcher`]; connection
//! state itself never touches job state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use advsec_core::types::JobId;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{PushClient, PushClientError, PushConnection};
use crate::dispatcher::EventDispatcher;
use crate::messages::OutgoingMessage;
use crate::reconnect::{reconnect_loop, AttemptObserver, ReconnectConfig};

/// How long [`ConnectionManager::close`] waits for the connection task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the push channel and its reconnect task.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    /// The supervising connection task, if one was started.
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// State shared between the manager and its connection task.
struct Shared {
    client: PushClient,
    config: ReconnectConfig,
    dispatcher: Arc<EventDispatcher>,
    state_tx: watch::Sender<ConnectionState>,
    /// Consecutive failed attempts; reset on success.
    reconnect_attempts: AtomicU32,
    interests: Mutex<Interests>,
    cancel: CancellationToken,
}

/// Recorded job interests plus the live session's outbound queue.
///
/// Kept under one lock so a subscribe can never slip between the
/// resubscribe pass and the session becoming writable.
#[derive(Default)]
struct Interests {
    jobs: HashSet<JobId>,
    outbound: Option<mpsc::UnboundedSender<OutgoingMessage>>,
}

impl ConnectionManager {
    pub fn new(client: PushClient, config: ReconnectConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                client,
                config,
                dispatcher,
                state_tx,
                reconnect_attempts: AtomicU32::new(0),
                interests: Mutex::new(Interests::default()),
                cancel: CancellationToken::new(),
            }),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the connection task unless one is already running.
    ///
    /// Returns `true` only for the call that initiated the attempt. Must be
    /// called from within a tokio runtime.
    pub fn connect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("Push channel closed, ignoring connect");
            return false;
        }

        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let initiated = self.shared.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !initiated {
            return false;
        }

        tracing::info!(url = %self.shared.client.ws_url(), "Starting push channel");
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            run_connection_loop(&shared).await;
            shared.detach_outbound();
            shared.state_tx.send_replace(ConnectionState::Disconnected);
            tracing::info!("Push channel task exited");
        }));
        true
    }

    /// Queue an envelope on the live session.
    ///
    /// Returns `false` (and logs a warning) when not connected.
    pub fn send(&self, message: OutgoingMessage) -> bool {
        let interests = self.shared.lock_interests();
        let Some(outbound) = interests.outbound.as_ref() else {
            tracing::warn!(message = ?message, "Push channel not connected, dropping message");
            return false;
        };
        if outbound.send(message).is_err() {
            tracing::warn!("Push session ended, dropping message");
            return false;
        }
        true
    }

    /// Record interest in a job and subscribe to it if connected.
    ///
    /// The interest survives reconnects. Returns whether the subscribe
    /// envelope was queued now.
    pub fn subscribe(&self, job_id: &str) -> bool {
        let mut interests = self.shared.lock_interests();
        interests.jobs.insert(job_id.to_string());
        match &interests.outbound {
            Some(outbound) => outbound.send(OutgoingMessage::subscribe(job_id)).is_ok(),
            None => {
                tracing::debug!(job_id, "Push channel not connected, subscription deferred");
                false
            }
        }
    }

    /// Drop interest in a job. Returns whether it was recorded.
    pub fn unsubscribe(&self, job_id: &str) -> bool {
        self.shared.lock_interests().jobs.remove(job_id)
    }

    /// Job ids that will be resubscribed after a reconnect.
    pub fn interests(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self.shared.lock_interests().jobs.iter().cloned().collect();
        jobs.sort();
        jobs
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Tear down the push channel.
    ///
    /// Runs once; later calls are no-ops. Waits up to 5 seconds for the
    /// connection task to exit.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing push channel");
        self.shared.cancel.cancel();

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Push channel task did not exit in time");
            }
        }

        self.shared.detach_outbound();
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!("Push channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn lock_interests(&self) -> MutexGuard<'_, Interests> {
        lock(&self.interests)
    }

    /// Make a new session writable, queueing a subscribe for every
    /// recorded interest first.
    fn attach_outbound(&self, outbound: mpsc::UnboundedSender<OutgoingMessage>) {
        let mut interests = self.lock_interests();
        for job_id in &interests.jobs {
            let _ = outbound.send(OutgoingMessage::subscribe(job_id.as_str()));
        }
        if !interests.jobs.is_empty() {
            tracing::info!(count = interests.jobs.len(), "Resubscribing to monitored jobs");
        }
        interests.outbound = Some(outbound);
    }

    fn detach_outbound(&self) {
        self.lock_interests().outbound = None;
    }
}

impl AttemptObserver for Shared {
    fn attempt_started(&self, attempt: u32) {
        self.state_tx.send_replace(ConnectionState::Connecting);
        tracing::debug!(attempt, "Connecting to push channel");
    }

    fn attempt_failed(&self, attempt: u32, _error: &PushClientError) {
        self.reconnect_attempts.store(attempt, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Core connection loop: connect -> session -> wait -> reconnect.
///
/// Runs until the cancellation token is triggered.
async fn run_connection_loop(shared: &Shared) {
    loop {
        let Some(conn) = reconnect_loop(&shared.client, &shared.config, &shared.cancel, shared).await
        else {
            return;
        };

        shared.reconnect_attempts.store(0, Ordering::SeqCst);
        run_session(shared, conn).await;
        shared.detach_outbound();

        if shared.cancel.is_cancelled() {
            return;
        }
        shared.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::warn!(
            delay_ms = shared.config.delay.as_millis() as u64,
            "Push session ended, reconnecting",
        );

        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(shared.config.delay) => {}
        }
    }
}

/// Drive one WebSocket session: write queued envelopes and hand every
/// inbound text frame to the dispatcher.
async fn run_session(shared: &Shared, conn: PushConnection) {
    let client_id = conn.client_id;
    let (mut sink, mut stream) = conn.ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutgoingMessage>();

    shared.attach_outbound(outbound_tx);
    shared.state_tx.send_replace(ConnectionState::Connected);
    tracing::info!(client_id = %client_id, "Push session established");

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(message) = outbound_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(message.to_text())).await {
                    tracing::error!(error = %e, "Failed to send push envelope");
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        shared.dispatcher.handle_text(&text).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Backend closed push channel");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Push channel receive error");
                        break;
                    }
                    None => {
                        tracing::info!("Push stream exhausted");
                        break;
                    }
                }
            }
        }
    }
}
