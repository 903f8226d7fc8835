//! Push channel message types and parser.
//!
//! The backend pushes JSON text frames. Job events look like
//! `{"event_type": "task_completed", "task_data": {"task_id": ..., ...}}`,
//! either bare or wrapped as `{"type": "task_update", "data": {...}}`.
//! Connection and subscription acknowledgements use the same wrapped form.

use advsec_core::job::StatusUpdate;
use advsec_core::job_events::MSG_TYPE_SUBSCRIBE_TASK;
use serde::Deserialize;
use serde_json::Value;

/// Kind of a pushed job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PushEventKind {
    #[serde(rename = "task_progress")]
    TaskProgress,
    #[serde(rename = "task_completed")]
    TaskCompleted,
    #[serde(rename = "task_failed")]
    TaskFailed,
    /// Any event name this client does not act on.
    #[serde(other)]
    Unknown,
}

/// A pushed job event.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    pub event_type: PushEventKind,
    /// Some servers repeat the job id at the top level.
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task_data: Value,
}

impl PushEvent {
    /// The job this event belongs to.
    pub fn job_id(&self) -> Option<&str> {
        self.task_id
            .as_deref()
            .or_else(|| self.task_data.get("task_id").and_then(Value::as_str))
    }

    /// Translate the event into a [`StatusUpdate`], if it carries one.
    pub fn to_update(&self) -> Option<StatusUpdate> {
        let data = &self.task_data;
        let mut update = match self.event_type {
            PushEventKind::TaskProgress => StatusUpdate::running(),
            PushEventKind::TaskCompleted => StatusUpdate::completed(),
            PushEventKind::TaskFailed => StatusUpdate::failed(
                str_field(data, "error")
                    .or_else(|| str_field(data, "message"))
                    .unwrap_or("job failed"),
            ),
            PushEventKind::Unknown => return None,
        };

        if let Some(progress) = data.get("progress").filter(|p| !p.is_null()) {
            update.progress = Some(progress.clone());
        }
        if update.message.is_none() {
            update.message = str_field(data, "message").map(str::to_string);
        }
        if let Some(report_id) = str_field(data, "report_id") {
            update.result_ref = Some(report_id.to_string());
        }
        Some(update)
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Payload of a `subscribed` acknowledgement.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribedData {
    pub task_id: String,
}

/// Wrapped server frames, tagged by `"type"` with content in `"data"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
enum TaggedMessage {
    #[serde(rename = "task_update")]
    TaskUpdate(PushEvent),
    #[serde(rename = "connected")]
    Connected(serde::de::IgnoredAny),
    #[serde(rename = "subscribed")]
    Subscribed(SubscribedData),
}

/// All server frames this client understands.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// A job event to route to the dispatcher.
    TaskUpdate(PushEvent),
    /// Server greeting after the handshake.
    Connected,
    /// Acknowledgement of a `subscribe_task` envelope.
    Subscribed { task_id: String },
}

impl From<TaggedMessage> for ServerMessage {
    fn from(msg: TaggedMessage) -> Self {
        match msg {
            TaggedMessage::TaskUpdate(event) => ServerMessage::TaskUpdate(event),
            TaggedMessage::Connected(_) => ServerMessage::Connected,
            TaggedMessage::Subscribed(data) => ServerMessage::Subscribed {
                task_id: data.task_id,
            },
        }
    }
}

/// Parse a push channel text frame.
///
/// Returns `Err` for malformed JSON or frames matching neither the
/// wrapped nor the bare event shape. Callers should log and continue.
pub fn parse_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    match serde_json::from_str::<TaggedMessage>(text) {
        Ok(msg) => Ok(msg.into()),
        Err(tagged_err) => serde_json::from_str::<PushEvent>(text)
            .map(ServerMessage::TaskUpdate)
            .map_err(|_| tagged_err),
    }
}

/// Frames the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    /// Register interest in push events for one job.
    Subscribe { task_id: String },
}

impl OutgoingMessage {
    pub fn subscribe(task_id: impl Into<String>) -> Self {
        OutgoingMessage::Subscribe {
            task_id: task_id.into(),
        }
    }

    /// Serialize to the JSON text frame sent over the wire.
    pub fn to_text(&self) -> String {
        match self {
            OutgoingMessage::Subscribe { task_id } => serde_json::json!({
                "type": MSG_TYPE_SUBSCRIBE_TASK,
                "task_id": task_id,
            })
            .to_string(),
        }
    }
}
