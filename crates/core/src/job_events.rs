//! Push channel message name constants for job lifecycle events.
//!
//! Used by the monitor's push message parser and by the subscribe
//! envelope it sends after every (re)connection.

/// Sent by the client to register interest in a job's push events.
pub const MSG_TYPE_SUBSCRIBE_TASK: &str = "subscribe_task";

/// Progress update for a running job.
pub const EVENT_TASK_PROGRESS: &str = "task_progress";

/// Job completed successfully.
pub const EVENT_TASK_COMPLETED: &str = "task_completed";

/// Job failed on the backend.
pub const EVENT_TASK_FAILED: &str = "task_failed";
