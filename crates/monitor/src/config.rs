use std::time::Duration;

use advsec_core::error::CoreError;

use crate::api::DEFAULT_REQUEST_TIMEOUT;
use crate::reconnect::ReconnectConfig;
use crate::watcher::WatcherConfig;

/// Monitor configuration loaded from environment variables.
///
/// All fields have defaults suitable for a backend on localhost.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Base URL of the REST API, without the `/api` suffix.
    pub api_url: String,
    /// Push endpoint. `None` disables push delivery; jobs are then
    /// advanced by polling alone.
    pub ws_url: Option<String>,
    pub request_timeout: Duration,
    pub watcher: WatcherConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000".into(),
            ws_url: Some("ws://localhost:5000/ws".into()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            watcher: WatcherConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                | Default                   |
    /// |------------------------|---------------------------|
    /// | `BACKEND_API_URL`      | `http://localhost:5000`   |
    /// | `BACKEND_WS_URL`       | `ws://localhost:5000/ws`  |
    /// | `POLL_INTERVAL_SECS`   | `2`                       |
    /// | `MAX_POLL_ERRORS`      | `5`                       |
    /// | `RECONNECT_DELAY_SECS` | `1`                       |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                      |
    ///
    /// An empty `BACKEND_WS_URL` disables push delivery.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let api_url = lookup("BACKEND_API_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        if api_url.is_empty() {
            return Err(CoreError::Validation("BACKEND_API_URL must not be empty".into()));
        }

        let ws_url = match lookup("BACKEND_WS_URL") {
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(s.trim().to_string()),
            None => defaults.ws_url,
        };

        let poll_interval = secs(&lookup, "POLL_INTERVAL_SECS", defaults.watcher.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(CoreError::Validation("POLL_INTERVAL_SECS must be positive".into()));
        }

        let max_errors = match lookup("MAX_POLL_ERRORS") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                CoreError::Validation(format!("MAX_POLL_ERRORS must be a valid u32, got {raw:?}"))
            })?,
            None => defaults.watcher.max_errors,
        };
        if max_errors == 0 {
            return Err(CoreError::Validation("MAX_POLL_ERRORS must be at least 1".into()));
        }

        let delay = secs(&lookup, "RECONNECT_DELAY_SECS", defaults.reconnect.delay)?;
        if delay.is_zero() {
            return Err(CoreError::Validation("RECONNECT_DELAY_SECS must be positive".into()));
        }
        let request_timeout = secs(&lookup, "REQUEST_TIMEOUT_SECS", defaults.request_timeout)?;

        Ok(Self {
            api_url,
            ws_url,
            request_timeout,
            watcher: WatcherConfig {
                poll_interval,
                max_errors,
            },
            reconnect: ReconnectConfig { delay },
        })
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, CoreError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| CoreError::Validation(format!("{key} must be a whole number of seconds, got {raw:?}"))),
        None => Ok(default),
    }
}
