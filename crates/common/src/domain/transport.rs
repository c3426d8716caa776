use crate::domain::PublishError;
use async_trait::async_trait;

/// Broker acknowledgement of an accepted publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub topic: String,
    pub payload_size: usize,
}

/// Outbound side of the broker transport.
///
/// Implementations must fail with `PublishError::NotConnected` instead of
/// queueing while no session is established.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, PublishError>;
}
