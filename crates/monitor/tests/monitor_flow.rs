//! End-to-end monitor flows over HTTP with push delivery disabled.

use std::time::Duration;

use advsec_core::job::{AbortReason, JobKind, JobStatus};
use advsec_monitor::api::ApiError;
use advsec_monitor::config::MonitorConfig;
use advsec_monitor::monitor::{MonitorError, TaskMonitor};
use advsec_monitor::watcher::WatcherConfig;
use assert_matches::assert_matches;
use serde_json::json;
use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FLOW_TIMEOUT: Duration = Duration::from_secs(10);

fn config(server: &MockServer) -> MonitorConfig {
    MonitorConfig {
        api_url: server.uri(),
        ws_url: None,
        watcher: WatcherConfig {
            poll_interval: Duration::from_millis(20),
            max_errors: 3,
        },
        ..MonitorConfig::default()
    }
}

fn status_body(status: &str) -> serde_json::Value {
    json!({"success": true, "status": {"status": status}})
}

// ---------------------------------------------------------------------------
// Test: submit -> poll to completion -> fetch result once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_job_is_polled_to_completion() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/evaluation/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "task_id": "J1",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/evaluation/status/J1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body("running")))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/evaluation/status/J1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "status": {"status": "completed", "report_id": "R1"},
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/evaluation/results/R1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"accuracy": 0.93, "robust_accuracy": 0.41},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let monitor = TaskMonitor::start(config(&server)).unwrap();
    let mut sub = monitor
        .submit(JobKind::Evaluation, &json!({"model": "resnet18"}))
        .await
        .unwrap();
    assert_eq!(sub.job_id(), "J1");

    let job = timeout(FLOW_TIMEOUT, sub.wait_terminal()).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_ref.as_deref(), Some("R1"));

    let deadline = tokio::time::Instant::now() + FLOW_TIMEOUT;
    while monitor.last_result(JobKind::Evaluation).await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "result never fetched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        monitor.last_result(JobKind::Evaluation).await,
        Some(json!({"accuracy": 0.93, "robust_accuracy": 0.41}))
    );

    let notifications = monitor.notifications().await;
    assert_eq!(notifications.len(), 1);
    assert!(monitor.acknowledge("J1").await);
    assert!(monitor.notifications().await.is_empty());

    monitor.shutdown().await;
    server.verify().await;
}

// ---------------------------------------------------------------------------
// Test: a rejected submission never enters the registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_submission_is_not_monitored() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/attack/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error": "unknown attack method",
        })))
        .mount(&server)
        .await;

    let monitor = TaskMonitor::start(config(&server)).unwrap();
    let err = monitor
        .submit(JobKind::Attack, &json!({"attack": "nope"}))
        .await
        .unwrap_err();

    assert_matches!(err, MonitorError::Submission(ApiError::Rejected(_)));
    assert!(monitor.jobs().await.is_empty());
    monitor.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: a missing status endpoint aborts the job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_status_endpoint_aborts_job() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/batch-testing/status/B1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let monitor = TaskMonitor::start(config(&server)).unwrap();
    let mut sub = monitor.watch("B1", JobKind::BatchTest).await.unwrap();

    let job = timeout(FLOW_TIMEOUT, sub.wait_terminal()).await.unwrap();
    assert_eq!(job.status, JobStatus::Aborted);
    assert_eq!(job.abort_reason, Some(AbortReason::StatusUnsupported));

    tokio::time::sleep(Duration::from_millis(100)).await;
    monitor.shutdown().await;
    server.verify().await;
}

// ---------------------------------------------------------------------------
// Test: repeated server errors exhaust the retry budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_errors_lose_monitoring() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/finetuning/status/F1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let monitor = TaskMonitor::start(config(&server)).unwrap();
    let mut sub = monitor.watch("F1", JobKind::Finetuning).await.unwrap();

    let job = timeout(FLOW_TIMEOUT, sub.wait_terminal()).await.unwrap();
    assert_eq!(job.status, JobStatus::Aborted);
    assert_eq!(job.abort_reason, Some(AbortReason::MonitoringLost));

    tokio::time::sleep(Duration::from_millis(100)).await;
    monitor.shutdown().await;
    server.verify().await;
}

// ---------------------------------------------------------------------------
// Test: manual refresh and dismissal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_then_dismiss_terminal_job() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/attack/status/A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "status": {"status": "failed", "error": "model checkpoint missing"},
        })))
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.watcher.poll_interval = Duration::from_secs(3600);
    let monitor = TaskMonitor::start(config).unwrap();
    monitor.watch("A1", JobKind::Attack).await.unwrap();

    assert_matches!(
        monitor.dismiss("A1").await,
        Err(MonitorError::Core(advsec_core::error::CoreError::Conflict(_)))
    );

    let job = monitor.refresh("A1").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message.as_deref(), Some("model checkpoint missing"));

    let removed = monitor.dismiss("A1").await.unwrap();
    assert_eq!(removed.job_id, "A1");
    assert!(monitor.job("A1").await.is_none());

    monitor.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: health check
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_reaches_backend() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&server)
        .await;

    let monitor = TaskMonitor::start(config(&server)).unwrap();
    assert_eq!(monitor.health().await.unwrap(), json!({"status": "healthy"}));
    monitor.shutdown().await;
}
