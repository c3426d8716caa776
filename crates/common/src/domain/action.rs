use crate::domain::MessageId;
use serde::Serialize;

/// Work derived from a stored message and executed during a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Push an event to every live subscriber
    SseBroadcast { event: serde_json::Value },
    /// Publish a payload to the broker
    PublishMessage {
        topic: String,
        payload: serde_json::Value,
    },
    /// Run an external command
    InvokeScript { command: String, args: Vec<String> },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::SseBroadcast { .. } => "sse_broadcast",
            ActionKind::PublishMessage { .. } => "publish_message",
            ActionKind::InvokeScript { .. } => "invoke_script",
        }
    }
}

/// An action bound to the message it was derived from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub message_id: MessageId,
    /// Name of the derivation rule that produced this action
    pub rule: &'static str,
    pub kind: ActionKind,
}

impl Action {
    pub fn new(message_id: MessageId, rule: &'static str, kind: ActionKind) -> Self {
        Self {
            message_id,
            rule,
            kind,
        }
    }
}
