use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ConnectivityError, PublishError};
use std::sync::Arc;

/// A raw payload received from the broker, not yet validated
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPayload {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Factory for broker sessions.
///
/// `open` resolves only once the session is established and subscribed to
/// `subscribe_topic`; the connector reports `Connected` after that.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn open(&self, subscribe_topic: &str) -> Result<BrokerSession, ConnectivityError>;
}

/// One established broker session
pub struct BrokerSession {
    pub publisher: Arc<dyn SessionPublisher>,
    pub events: Box<dyn SessionEvents>,
}

#[async_trait]
pub trait SessionPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    async fn disconnect(&self);
}

/// Inbound side of a session. Also drives the session's I/O, so it must be
/// polled continuously while the session is alive.
#[async_trait]
pub trait SessionEvents: Send {
    /// Next inbound publish. An error means the session is gone.
    async fn next(&mut self) -> Result<InboundPayload, ConnectivityError>;
}
