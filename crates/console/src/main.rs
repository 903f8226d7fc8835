//! `advsec-console` -- launch and follow model-security jobs.
//!
//! Submits attack, evaluation, fine-tuning and batch-testing jobs to the
//! testing platform backend and follows them to a terminal state using
//! both status polling and the push channel.
//!
//! # Environment variables
//!
//! | Variable               | Default                  | Description                         |
//! |------------------------|--------------------------|-------------------------------------|
//! | `BACKEND_API_URL`      | `http://localhost:5000`  | REST API base URL                   |
//! | `BACKEND_WS_URL`       | `ws://localhost:5000/ws` | Push endpoint; empty disables push  |
//! | `POLL_INTERVAL_SECS`   | `2`                      | Seconds between status polls        |
//! | `MAX_POLL_ERRORS`      | `5`                      | Consecutive poll failures tolerated |
//! | `RECONNECT_DELAY_SECS` | `1`                      | Delay between push reconnects       |
//! | `REQUEST_TIMEOUT_SECS` | `30`                     | HTTP request timeout                |

use std::process::ExitCode;
use std::time::Duration;

use advsec_console::cli::{Cli, Command};
use advsec_console::report;
use advsec_core::job::JobStatus;
use advsec_monitor::config::MonitorConfig;
use advsec_monitor::monitor::TaskMonitor;
use advsec_monitor::registry::Subscription;
use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for a completed job's result artifact.
const RESULT_WAIT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "advsec_console=info,advsec_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = MonitorConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        ws_url = config.ws_url.as_deref().unwrap_or("<disabled>"),
        poll_interval_secs = config.watcher.poll_interval.as_secs(),
        "Starting advsec-console",
    );

    let monitor = TaskMonitor::start(config)?;
    let result = run(&monitor, cli.command).await;
    monitor.shutdown().await;

    result.map(ExitCode::from)
}

async fn run(monitor: &TaskMonitor, command: Command) -> anyhow::Result<u8> {
    match command {
        Command::Health => {
            let body = monitor.health().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(0)
        }
        Command::Submit { kind, params } => {
            let text = std::fs::read_to_string(&params)
                .with_context(|| format!("Failed to read {}", params.display()))?;
            let params: Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", params.display()))?;

            let subscription = monitor.submit(kind, &params).await?;
            println!("Submitted {kind} job {}", subscription.job_id());
            follow(monitor, subscription).await
        }
        Command::Watch { kind, job_id } => {
            let subscription = monitor.watch(&job_id, kind).await?;
            follow(monitor, subscription).await
        }
    }
}

/// Print progress until the job settles or the user interrupts.
async fn follow(monitor: &TaskMonitor, mut subscription: Subscription) -> anyhow::Result<u8> {
    let job_id = subscription.job_id().to_string();
    println!("{}", report::progress_line(&subscription.current()));

    let job = loop {
        tokio::select! {
            changed = subscription.changed() => match changed {
                Some(job) if job.is_terminal() => break job,
                Some(job) => println!("{}", report::progress_line(&job)),
                None => break subscription.current(),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(job_id = %job_id, "Interrupted, stopping monitoring");
                break monitor.cancel(&job_id).await?;
            }
        }
    };

    println!("{}", report::outcome_line(&job));
    if job.status == JobStatus::Completed && job.result_ref.is_some() {
        match wait_for_result(&subscription).await {
            Some(Ok(result)) => println!("{}", serde_json::to_string_pretty(&result)?),
            Some(Err(error)) => tracing::warn!(job_id = %job_id, error = %error, "Result not available"),
            None => tracing::warn!(job_id = %job_id, "Result not available"),
        }
    }
    monitor.acknowledge(&job_id).await;

    Ok(report::exit_code(&job))
}

/// Wait until the result worker has attached the job's artifact or
/// recorded why it could not. `None` on timeout or once the job is gone.
async fn wait_for_result(subscription: &Subscription) -> Option<Result<Value, String>> {
    let mut listener = subscription.listener();
    let settled = tokio::time::timeout(
        RESULT_WAIT,
        listener.wait_for(|job| job.result.is_some() || job.result_error.is_some()),
    )
    .await;
    let job = settled.ok()?.ok()?.clone();

    match (job.result, job.result_error) {
        (Some(result), _) => Some(Ok(result)),
        (None, Some(error)) => Some(Err(error)),
        (None, None) => None,
    }
}
