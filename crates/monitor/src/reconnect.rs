//! Fixed-delay reconnection for the push channel.
//!
//! Jobs run for minutes, so short gaps in push delivery never justify
//! giving up: [`reconnect_loop`] retries without bound, waiting a fixed
//! delay between attempts, until it connects or the
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{PushClient, PushClientError, PushConnection};

/// Default delay between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Tunable parameters for the reconnection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay between a failed attempt (or a dropped session) and the next attempt.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Hooks invoked around each connection attempt.
pub trait AttemptObserver {
    /// An attempt numbered `attempt` (1-based) is about to start.
    fn attempt_started(&self, attempt: u32);

    /// The attempt failed; the loop will wait and retry.
    fn attempt_failed(&self, attempt: u32, error: &PushClientError);
}

/// Connect, retrying with a fixed delay until success.
///
/// Returns `Some(connection)` once a connection succeeds, or `None` if
/// `cancel` is triggered first.
pub async fn reconnect_loop(
    client: &PushClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
    observer: &impl AttemptObserver,
) -> Option<PushConnection> {
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        attempt = attempt.saturating_add(1);
        observer.attempt_started(attempt);

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(attempt, "Push channel connect cancelled");
                return None;
            }
            result = client.connect() => {
                match result {
                    Ok(conn) => {
                        if attempt > 1 {
                            tracing::info!(attempt, "Reconnected to push channel");
                        }
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            delay_ms = config.delay.as_millis() as u64,
                            "Push channel connect attempt {attempt} failed",
                        );
                        observer.attempt_failed(attempt, &e);
                    }
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(config.delay) => {}
        }
    }
}
