//! Routes inbound push events to the monitored job they belong to.
//!
//! The dispatcher applies the same merge rules as the poll path through
//! [`TaskRegistry::apply`]. When a push event is the first terminal signal
//! for a job, the registry stops that job's watcher so the duplicate poll
//! timer is cancelled.

use std::sync::Arc;

use advsec_core::job::ApplyOutcome;

use crate::messages::{parse_message, PushEvent, ServerMessage};
use crate::registry::TaskRegistry;

/// Push-path counterpart of the job watcher.
pub struct EventDispatcher {
    registry: Arc<TaskRegistry>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Parse one text frame from the push channel and route it.
    ///
    /// Malformed frames are logged and dropped.
    pub async fn handle_text(&self, text: &str) -> Option<ApplyOutcome> {
        match parse_message(text) {
            Ok(ServerMessage::TaskUpdate(event)) => self.dispatch(&event).await,
            Ok(ServerMessage::Connected) => {
                tracing::debug!("Push channel greeting received");
                None
            }
            Ok(ServerMessage::Subscribed { task_id }) => {
                tracing::debug!(job_id = %task_id, "Push subscription acknowledged");
                None
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_message = %text,
                    "Failed to parse push message",
                );
                None
            }
        }
    }

    /// Apply a push event to its job.
    ///
    /// Returns `None` when the event is dropped: no job id, an event kind
    /// that carries no update, or a job that is not monitored.
    pub async fn dispatch(&self, event: &PushEvent) -> Option<ApplyOutcome> {
        let Some(job_id) = event.job_id() else {
            tracing::warn!(event_type = ?event.event_type, "Push event without a job id");
            return None;
        };
        let Some(update) = event.to_update() else {
            tracing::debug!(job_id, event_type = ?event.event_type, "Ignoring push event");
            return None;
        };

        match self.registry.apply(job_id, update).await {
            Some(outcome) => {
                match outcome {
                    ApplyOutcome::Terminal => {
                        tracing::info!(job_id, event_type = ?event.event_type, "Push event settled job");
                    }
                    ApplyOutcome::Ignored => {
                        tracing::debug!(job_id, "Push event for terminal job discarded");
                    }
                    ApplyOutcome::Progressed => {}
                }
                Some(outcome)
            }
            None => {
                tracing::debug!(job_id, "Push event for unmonitored job dropped");
                None
            }
        }
    }
}
