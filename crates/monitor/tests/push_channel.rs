//! Push-path tests against a local WebSocket server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use advsec_core::job::{JobKind, JobStatus, StatusUpdate};
use advsec_monitor::api::{BackendApi, PollError, StatusReport, StatusSource};
use advsec_monitor::client::PushClient;
use advsec_monitor::config::MonitorConfig;
use advsec_monitor::connection::{ConnectionManager, ConnectionState};
use advsec_monitor::dispatcher::EventDispatcher;
use advsec_monitor::monitor::TaskMonitor;
use advsec_monitor::reconnect::ReconnectConfig;
use advsec_monitor::registry::TaskRegistry;
use advsec_monitor::watcher::WatcherConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

/// Accept WebSocket connections and hand each one to the test.
async fn start_server() -> (String, mpsc::UnboundedReceiver<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if tx.send(ws).is_err() {
                break;
            }
        }
    });

    (format!("ws://{addr}/ws"), rx)
}

async fn next_connection(rx: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("no client connected in time")
        .expect("server stopped")
}

/// Read the next JSON text frame from the client.
async fn next_json(ws: &mut ServerSocket) -> Value {
    loop {
        let frame = timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("no frame in time");
        match frame {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("Unexpected frame: {other:?}"),
        }
    }
}

async fn push(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn subscribe_frame(job_id: &str) -> Value {
    json!({"type": "subscribe_task", "task_id": job_id})
}

/// Never settles a job by polling; counts result fetches.
#[derive(Default)]
struct PollNeverSettles {
    result_calls: AtomicU32,
}

#[async_trait]
impl StatusSource for PollNeverSettles {
    async fn fetch_status(&self, _: JobKind, _: &str) -> Result<StatusReport, PollError> {
        Ok(StatusReport {
            status: "running".into(),
            ..Default::default()
        })
    }

    async fn fetch_result(&self, _: JobKind, result_ref: &str) -> Result<Value, PollError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "report_id": result_ref }))
    }
}

// ---------------------------------------------------------------------------
// Test: a pushed completion settles the job before any poll does
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_completion_settles_job_and_fetches_result() {
    let (ws_url, mut connections) = start_server().await;
    let source = Arc::new(PollNeverSettles::default());
    let config = MonitorConfig {
        ws_url: Some(ws_url),
        watcher: WatcherConfig {
            poll_interval: Duration::from_secs(3600),
            max_errors: 5,
        },
        reconnect: ReconnectConfig {
            delay: Duration::from_millis(20),
        },
        ..MonitorConfig::default()
    };
    let api = Arc::new(BackendApi::with_client(reqwest::Client::new(), "http://127.0.0.1:9"));
    let monitor = TaskMonitor::with_source(config, api, source.clone());

    let mut sub = monitor.watch("J2", JobKind::Attack).await.unwrap();

    let mut ws = next_connection(&mut connections).await;
    push(&mut ws, json!({"type": "connected", "data": {"client_id": "c1"}})).await;
    assert_eq!(next_json(&mut ws).await, subscribe_frame("J2"));

    push(
        &mut ws,
        json!({"event_type": "task_progress", "task_data": {"task_id": "J2", "progress": {"current_sample": 5, "total_samples": 10}}}),
    )
    .await;
    push(
        &mut ws,
        json!({"event_type": "task_completed", "task_data": {"task_id": "J2", "report_id": "R2"}}),
    )
    .await;

    let job = timeout(STEP_TIMEOUT, sub.wait_terminal()).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_ref.as_deref(), Some("R2"));
    assert_eq!(job.progress.fraction(), Some(0.5));
    assert_eq!(monitor.connection_state(), ConnectionState::Connected);

    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while monitor.last_result(JobKind::Attack).await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "result never fetched");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(source.result_calls.load(Ordering::SeqCst), 1);

    monitor.shutdown().await;
    assert_eq!(monitor.connection_state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Test: interests are resubscribed after the server drops the connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_resubscribes_recorded_interests() {
    let (ws_url, mut connections) = start_server().await;
    let registry = Arc::new(TaskRegistry::new());
    let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
    let manager = ConnectionManager::new(
        PushClient::new(ws_url),
        ReconnectConfig {
            delay: Duration::from_millis(20),
        },
        dispatcher,
    );

    let sub = registry.register("J1", JobKind::Evaluation).await.unwrap();
    manager.subscribe("J1");
    assert!(manager.connect());

    let mut first = next_connection(&mut connections).await;
    assert_eq!(next_json(&mut first).await, subscribe_frame("J1"));
    first.close(None).await.unwrap();
    drop(first);

    let mut second = next_connection(&mut connections).await;
    assert_eq!(next_json(&mut second).await, subscribe_frame("J1"));
    assert_eq!(manager.reconnect_attempts(), 0);

    push(
        &mut second,
        json!({"event_type": "task_failed", "task_data": {"task_id": "J1", "error": "GPU lost"}}),
    )
    .await;

    let mut listener = sub.listener();
    let job = timeout(
        STEP_TIMEOUT,
        listener.wait_for(|job| job.is_terminal()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message.as_deref(), Some("GPU lost"));

    manager.close().await;
}

// ---------------------------------------------------------------------------
// Test: re-watching a settled job keeps its interest across reconnects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rewatched_job_is_resubscribed_after_reconnect() {
    let (ws_url, mut connections) = start_server().await;
    let source = Arc::new(PollNeverSettles::default());
    let config = MonitorConfig {
        ws_url: Some(ws_url),
        watcher: WatcherConfig {
            poll_interval: Duration::from_secs(3600),
            max_errors: 5,
        },
        reconnect: ReconnectConfig {
            delay: Duration::from_millis(20),
        },
        ..MonitorConfig::default()
    };
    let api = Arc::new(BackendApi::with_client(reqwest::Client::new(), "http://127.0.0.1:9"));
    let monitor = TaskMonitor::with_source(config, api, source.clone());

    monitor.watch("J1", JobKind::Attack).await.unwrap();
    let mut first = next_connection(&mut connections).await;
    assert_eq!(next_json(&mut first).await, subscribe_frame("J1"));

    monitor
        .registry()
        .apply("J1", StatusUpdate::completed().with_result_ref("R1"))
        .await;
    let sub = monitor.watch("J1", JobKind::Attack).await.unwrap();
    assert_eq!(sub.current().status, JobStatus::Submitted);
    assert_eq!(next_json(&mut first).await, subscribe_frame("J1"));

    // Let the result worker handle the first registration's completion.
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while source.result_calls.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "result never fetched");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(monitor.registry().is_active("J1").await);

    first.close(None).await.unwrap();
    drop(first);

    let mut second = next_connection(&mut connections).await;
    assert_eq!(next_json(&mut second).await, subscribe_frame("J1"));

    monitor.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: subscriptions made while connected go out immediately
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_while_connected_sends_envelope() {
    let (ws_url, mut connections) = start_server().await;
    let dispatcher = Arc::new(EventDispatcher::new(Arc::new(TaskRegistry::new())));
    let manager = ConnectionManager::new(PushClient::new(ws_url), ReconnectConfig::default(), dispatcher);

    let mut state = manager.watch_state();
    assert!(manager.connect());
    let mut ws = next_connection(&mut connections).await;
    timeout(STEP_TIMEOUT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    assert!(manager.subscribe("J9"));
    assert_eq!(next_json(&mut ws).await, subscribe_frame("J9"));

    manager.close().await;
}

// ---------------------------------------------------------------------------
// Test: concurrent connect() opens a single connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_connect_opens_one_connection() {
    let (ws_url, mut connections) = start_server().await;
    let dispatcher = Arc::new(EventDispatcher::new(Arc::new(TaskRegistry::new())));
    let manager = Arc::new(ConnectionManager::new(
        PushClient::new(ws_url),
        ReconnectConfig::default(),
        dispatcher,
    ));

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect() })
        })
        .collect();
    let mut initiated = 0;
    for call in calls {
        if call.await.unwrap() {
            initiated += 1;
        }
    }
    assert_eq!(initiated, 1);

    let _ws = next_connection(&mut connections).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connections.try_recv().is_err());
    assert!(!manager.connect());

    manager.close().await;
}
