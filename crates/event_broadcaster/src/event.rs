use chrono::{DateTime, Utc};
use serde_json::json;

/// Event delivered to SSE subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// A processed telemetry message
    Message(serde_json::Value),
    /// Keep-alive used to surface half-open connections
    Heartbeat { at: DateTime<Utc> },
    /// Last event a subscriber receives before it is removed
    Close,
}

impl BroadcastEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            BroadcastEvent::Message(_) => "message",
            BroadcastEvent::Heartbeat { .. } => "ping",
            BroadcastEvent::Close => "close",
        }
    }

    pub fn data(&self) -> serde_json::Value {
        match self {
            BroadcastEvent::Message(value) => value.clone(),
            BroadcastEvent::Heartbeat { at } => json!({ "timestamp": at.to_rfc3339() }),
            BroadcastEvent::Close => json!({}),
        }
    }

    /// Wire form: `event:` and `data:` lines terminated by a blank line
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.data())
    }
}
