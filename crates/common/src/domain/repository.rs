use crate::domain::{
    MessageId, MessagePage, MessageQuery, ProcessingOutcome, StorageError, StoredMessage,
    TelemetryPacket,
};
use async_trait::async_trait;

/// Durable store for telemetry packets and their processing status.
///
/// Implementations own a bounded connection pool. Every operation leases a
/// connection for its duration and releases it on every exit path.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Durably write a packet, assigning `id` and `received_at`.
    ///
    /// Transient failures are retried with bounded backoff before surfacing
    /// `StorageError::Unavailable`; constraint violations surface immediately as
    /// `StorageError::Rejected`.
    async fn ingest(&self, packet: &TelemetryPacket) -> Result<MessageId, StorageError>;

    /// Up to `limit` unprocessed messages, ascending by `received_at` then `id`.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<StoredMessage>, StorageError>;

    /// Compare-and-set on `processed`.
    ///
    /// A second call for an already processed id succeeds without touching the
    /// recorded outcome.
    async fn mark_processed(
        &self,
        id: MessageId,
        outcome: ProcessingOutcome,
    ) -> Result<(), StorageError>;

    /// Read-only query independent of processing status
    async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage, StorageError>;

    /// Number of messages still waiting to be processed
    async fn pending_count(&self) -> Result<u64, StorageError>;

    /// Close the pool once every outstanding lease has been released
    async fn close(&self);
}
