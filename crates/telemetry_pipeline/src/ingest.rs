use common::validation::SchemaValidator;
use common::{MessageId, MessageRepository, SubmitError, TelemetryPacket};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transport_connector::{InboundPayload, TransportConnector};

/// Validate then persist. Shared by packet submission and the inbound worker
/// so nothing reaches storage without passing the schema.
#[derive(Clone)]
pub struct Ingestor {
    validator: Arc<SchemaValidator>,
    repository: Arc<dyn MessageRepository>,
}

impl Ingestor {
    pub fn new(validator: Arc<SchemaValidator>, repository: Arc<dyn MessageRepository>) -> Self {
        Self {
            validator,
            repository,
        }
    }

    pub async fn accept(&self, raw: &[u8]) -> Result<(MessageId, TelemetryPacket), SubmitError> {
        let packet = self.validator.validate(raw)?;
        let id = self.repository.ingest(&packet).await?;
        Ok((id, packet))
    }
}

/// Consumes the connector's inbound stream until cancelled. Invalid payloads
/// are logged and dropped; storage failures are logged and the payload is lost.
pub struct IngestWorker {
    ingestor: Ingestor,
    connector: Arc<TransportConnector>,
}

impl IngestWorker {
    pub fn new(ingestor: Ingestor, connector: Arc<TransportConnector>) -> Self {
        Self {
            ingestor,
            connector,
        }
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let Some(mut inbound) = self.connector.on_message() else {
            anyhow::bail!("inbound stream is already being consumed");
        };
        info!("ingest worker started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                payload = inbound.next() => match payload {
                    Some(payload) => self.handle(payload).await,
                    None => {
                        warn!("inbound stream ended");
                        break;
                    }
                },
            }
        }

        info!("ingest worker stopped");
        Ok(())
    }

    async fn handle(&self, payload: InboundPayload) {
        match self.ingestor.accept(&payload.payload).await {
            Ok((id, packet)) => {
                debug!(
                    message_id = %id,
                    device_id = packet.device_id(),
                    topic = %payload.topic,
                    "inbound packet stored"
                );
            }
            Err(SubmitError::Validation(e)) => {
                warn!(
                    topic = %payload.topic,
                    payload_size = payload.payload.len(),
                    error = %e,
                    "dropping invalid inbound payload"
                );
            }
            Err(SubmitError::Storage(e)) => {
                error!(topic = %payload.topic, error = %e, "failed to store inbound packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::memory::InMemoryMessageRepository;
    use common::{MockMessageRepository, StorageError, ValidationError};

    const VALID: &[u8] = br#"{"device_id":"esp32-1","timestamp":"2024-05-01T12:00:00Z","measurements":{"temperature":72.3},"status":"ok","battery_level":88}"#;

    fn validator() -> Arc<SchemaValidator> {
        Arc::new(SchemaValidator::new().unwrap())
    }

    #[tokio::test]
    async fn test_accept_stores_valid_packet() {
        let repository = Arc::new(InMemoryMessageRepository::default());
        let ingestor = Ingestor::new(validator(), repository.clone());

        let (id, packet) = ingestor.accept(VALID).await.unwrap();
        assert_eq!(id, MessageId::new(1));
        assert_eq!(packet.device_id(), "esp32-1");
        assert_eq!(repository.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accept_never_stores_invalid_packet() {
        let mut repository = MockMessageRepository::new();
        repository.expect_ingest().times(0);
        let ingestor = Ingestor::new(validator(), Arc::new(repository));

        let err = ingestor
            .accept(br#"{"device_id":"","measurements":{}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));

        let err = ingestor.accept(b"not json").await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Validation(ValidationError::MalformedJson(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_surfaces_storage_error() {
        let mut repository = MockMessageRepository::new();
        repository
            .expect_ingest()
            .returning(|_| Err(StorageError::Unavailable("connection reset".to_string())));
        let ingestor = Ingestor::new(validator(), Arc::new(repository));

        let err = ingestor.accept(VALID).await.unwrap_err();
        assert!(matches!(err, SubmitError::Storage(StorageError::Unavailable(_))));
    }
}
