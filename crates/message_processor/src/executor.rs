use crate::ScriptRunner;
use async_trait::async_trait;
use common::{Action, ActionExecutionError, ActionKind, ConfigWatch, TelemetryPublisher};
use event_broadcaster::{BroadcastEvent, EventBroadcaster};
use std::sync::Arc;
use tracing::debug;

/// Executes a single action. Failures are reported, never panicked.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> Result<(), ActionExecutionError>;
}

/// Routes each action kind to the component that performs it
pub struct DefaultActionExecutor {
    publisher: Arc<dyn TelemetryPublisher>,
    broadcaster: Arc<EventBroadcaster>,
    scripts: ScriptRunner,
    config: ConfigWatch,
}

impl DefaultActionExecutor {
    pub fn new(
        publisher: Arc<dyn TelemetryPublisher>,
        broadcaster: Arc<EventBroadcaster>,
        config: ConfigWatch,
    ) -> Self {
        Self {
            publisher,
            broadcaster,
            scripts: ScriptRunner::new(),
            config,
        }
    }
}

#[async_trait]
impl ActionExecutor for DefaultActionExecutor {
    async fn execute(&self, action: &Action) -> Result<(), ActionExecutionError> {
        match &action.kind {
            ActionKind::SseBroadcast { event } => {
                let delivered = self
                    .broadcaster
                    .broadcast(BroadcastEvent::Message(event.clone()));
                debug!(message_id = %action.message_id, subscribers = delivered, "event broadcast");
                Ok(())
            }
            ActionKind::PublishMessage { topic, payload } => {
                let bytes = serde_json::to_vec(payload)
                    .map_err(|e| ActionExecutionError::Encode(e.to_string()))?;
                self.publisher.publish(topic, bytes).await?;
                Ok(())
            }
            ActionKind::InvokeScript { command, args } => {
                let timeout = self.config.borrow().script_timeout();
                self.scripts.run(command, args, timeout).await
            }
        }
    }
}
