//! In-process implementation of [`MessageRepository`].
//!
//! Mirrors the PostgreSQL repository's ordering and idempotence semantics and
//! models its bounded connection pool with a semaphore, so lease exhaustion
//! and draining close behave the same way.

use crate::domain::{
    MessageId, MessagePage, MessageQuery, MessageRepository, ProcessingOutcome, StorageError,
    StoredMessage, TelemetryPacket,
};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    last_received_at: Option<DateTime<Utc>>,
    messages: BTreeMap<MessageId, StoredMessage>,
}

pub struct InMemoryMessageRepository {
    state: Mutex<MemoryState>,
    leases: Arc<Semaphore>,
    pool_size: u32,
    wait_timeout: Duration,
    close_timeout: Duration,
}

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

impl InMemoryMessageRepository {
    pub fn new(pool_size: usize, wait_timeout: Duration) -> Self {
        let pool_size = pool_size.clamp(1, Semaphore::MAX_PERMITS) as u32;
        Self {
            state: Mutex::new(MemoryState::default()),
            leases: Arc::new(Semaphore::new(pool_size as usize)),
            pool_size,
            wait_timeout,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// How long `close` waits for outstanding leases before closing anyway
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    async fn lease(&self) -> Result<OwnedSemaphorePermit, StorageError> {
        match tokio::time::timeout(self.wait_timeout, self.leases.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StorageError::Unavailable(
                "connection pool is closed".to_string(),
            )),
            Err(_) => Err(StorageError::PoolExhausted(self.wait_timeout)),
        }
    }

    /// Number of leases currently held
    pub fn leased(&self) -> usize {
        (self.pool_size as usize).saturating_sub(self.leases.available_permits())
    }
}

impl Default for InMemoryMessageRepository {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    #[instrument(skip_all, fields(device_id = %packet.device_id()))]
    async fn ingest(&self, packet: &TelemetryPacket) -> Result<MessageId, StorageError> {
        let _lease = self.lease().await?;
        let mut state = self.state.lock().await;

        state.next_id += 1;
        let id = MessageId::new(state.next_id);

        // Never go backwards even if the wall clock does
        let now = Utc::now().trunc_subsecs(6);
        let received_at = match state.last_received_at {
            Some(last) if last > now => last,
            _ => now,
        };
        state.last_received_at = Some(received_at);

        state.messages.insert(
            id,
            StoredMessage {
                id,
                packet: packet.clone(),
                received_at,
                processed: false,
                processed_at: None,
                processing_outcome: ProcessingOutcome::Pending,
            },
        );

        debug!(message_id = %id, "stored telemetry message");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let _lease = self.lease().await?;
        let state = self.state.lock().await;

        let mut pending: Vec<StoredMessage> = state
            .messages
            .values()
            .filter(|m| !m.processed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    #[instrument(skip_all, fields(message_id = %id, outcome = %outcome))]
    async fn mark_processed(
        &self,
        id: MessageId,
        outcome: ProcessingOutcome,
    ) -> Result<(), StorageError> {
        if outcome == ProcessingOutcome::Pending {
            return Err(StorageError::Rejected(
                "pending is not a terminal outcome".to_string(),
            ));
        }

        let _lease = self.lease().await?;
        let mut state = self.state.lock().await;

        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| StorageError::Rejected(format!("unknown message id {}", id)))?;

        if message.processed {
            debug!("message already processed, leaving outcome unchanged");
            return Ok(());
        }

        message.processed = true;
        message.processed_at = Some(Utc::now().trunc_subsecs(6));
        message.processing_outcome = outcome;
        Ok(())
    }

    #[instrument(skip_all, fields(limit = query.limit))]
    async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage, StorageError> {
        let filter = query
            .field_filter()
            .map_err(|e| StorageError::Rejected(e.to_string()))?;

        let _lease = self.lease().await?;
        let state = self.state.lock().await;

        let mut matching: Vec<&StoredMessage> = state
            .messages
            .values()
            .filter(|m| query.start_time.map_or(true, |start| m.received_at >= start))
            .filter(|m| query.end_time.map_or(true, |end| m.received_at <= end))
            .filter(|m| filter.as_ref().map_or(true, |f| f.matches(&m.packet)))
            .collect();
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));

        Ok(MessagePage {
            total_count: matching.len() as u64,
            items: matching.into_iter().take(query.limit).cloned().collect(),
        })
    }

    async fn pending_count(&self) -> Result<u64, StorageError> {
        let _lease = self.lease().await?;
        let state = self.state.lock().await;
        Ok(state.messages.values().filter(|m| !m.processed).count() as u64)
    }

    async fn close(&self) {
        // Holding every permit means no lease is outstanding
        let drained =
            tokio::time::timeout(self.close_timeout, self.leases.acquire_many(self.pool_size)).await;
        match drained {
            Ok(Err(_)) => {
                debug!("in-memory connection pool already closed");
                return;
            }
            Ok(Ok(_all)) => {}
            Err(_) => warn!(
                leased = self.leased(),
                "connection leases still outstanding at close timeout"
            ),
        }
        self.leases.close();
        info!("in-memory connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::SchemaValidator;

    fn packet(device_id: &str, temperature: f64, status: &str) -> TelemetryPacket {
        let raw = serde_json::json!({
            "device_id": device_id,
            "timestamp": "2024-05-01T12:00:00Z",
            "measurements": {"temperature": temperature},
            "status": status,
            "battery_level": 88
        });
        SchemaValidator::new().unwrap().validate_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_then_fetch_then_mark_processed() {
        let repo = InMemoryMessageRepository::default();

        let id = repo.ingest(&packet("esp32-1", 72.3, "ok")).await.unwrap();
        assert_eq!(id, MessageId::new(1));

        let pending = repo.fetch_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert!(!pending[0].processed);
        assert_eq!(pending[0].processing_outcome, ProcessingOutcome::Pending);

        repo.mark_processed(id, ProcessingOutcome::Success)
            .await
            .unwrap();
        assert!(repo.fetch_unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_processed_is_idempotent() {
        let repo = InMemoryMessageRepository::default();
        let id = repo.ingest(&packet("d", 1.0, "ok")).await.unwrap();

        repo.mark_processed(id, ProcessingOutcome::PartialFailure)
            .await
            .unwrap();
        let first = repo.query_messages(&MessageQuery::default()).await.unwrap();

        repo.mark_processed(id, ProcessingOutcome::Success)
            .await
            .unwrap();
        let second = repo.query_messages(&MessageQuery::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            second.items[0].processing_outcome,
            ProcessingOutcome::PartialFailure
        );
    }

    #[tokio::test]
    async fn test_mark_processed_rejects_unknown_id_and_pending() {
        let repo = InMemoryMessageRepository::default();
        let id = repo.ingest(&packet("d", 1.0, "ok")).await.unwrap();

        assert!(matches!(
            repo.mark_processed(MessageId::new(99), ProcessingOutcome::Success)
                .await,
            Err(StorageError::Rejected(_))
        ));
        assert!(matches!(
            repo.mark_processed(id, ProcessingOutcome::Pending).await,
            Err(StorageError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unprocessed_is_ordered_and_limited() {
        let repo = InMemoryMessageRepository::default();
        for i in 0..5 {
            repo.ingest(&packet(&format!("d{}", i), i as f64, "ok"))
                .await
                .unwrap();
        }
        repo.mark_processed(MessageId::new(2), ProcessingOutcome::Success)
            .await
            .unwrap();

        let pending = repo.fetch_unprocessed(3).await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert!(pending
            .windows(2)
            .all(|w| (w[0].received_at, w[0].id) <= (w[1].received_at, w[1].id)));
    }

    #[tokio::test]
    async fn test_query_newest_first_with_total_count() {
        let repo = InMemoryMessageRepository::default();
        for i in 0..5 {
            repo.ingest(&packet("esp32-1", i as f64, "ok")).await.unwrap();
        }
        repo.ingest(&packet("esp32-2", 1.0, "ok")).await.unwrap();

        let page = repo
            .query_messages(
                &MessageQuery::default()
                    .with_limit(2)
                    .with_field("device_id", "esp32-1"),
            )
            .await
            .unwrap();

        assert_eq!(page.total_count, 5);
        let ids: Vec<i64> = page.items.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![5, 4]);
    }

    #[tokio::test]
    async fn test_query_by_measurement_compares_numerically() {
        let repo = InMemoryMessageRepository::default();
        repo.ingest(&packet("d", 72.3, "ok")).await.unwrap();
        repo.ingest(&packet("d", 10.0, "ok")).await.unwrap();

        let page = repo
            .query_messages(&MessageQuery::default().with_field("temperature", "72.30"))
            .await
            .unwrap();

        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].packet.measurement("temperature"), Some(72.3));
    }

    #[tokio::test]
    async fn test_query_rejects_invalid_limit() {
        let repo = InMemoryMessageRepository::default();
        let result = repo
            .query_messages(&MessageQuery::default().with_limit(0))
            .await;
        assert!(matches!(result, Err(StorageError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_pending_count() {
        let repo = InMemoryMessageRepository::default();
        let id = repo.ingest(&packet("d", 1.0, "ok")).await.unwrap();
        repo.ingest(&packet("d", 2.0, "ok")).await.unwrap();
        repo.mark_processed(id, ProcessingOutcome::Success)
            .await
            .unwrap();

        assert_eq!(repo.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_beyond_capacity_times_out_with_pool_exhausted() {
        let repo = InMemoryMessageRepository::new(1, Duration::from_millis(50));
        let held = repo.lease().await.unwrap();

        let result = repo.ingest(&packet("d", 1.0, "ok")).await;
        assert_eq!(
            result,
            Err(StorageError::PoolExhausted(Duration::from_millis(50)))
        );

        drop(held);
        assert!(repo.ingest(&packet("d", 1.0, "ok")).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_waits_for_outstanding_leases() {
        let repo = Arc::new(InMemoryMessageRepository::new(2, Duration::from_secs(1)));
        let held = repo.lease().await.unwrap();
        assert_eq!(repo.leased(), 1);

        let closer = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.close().await })
        };
        tokio::task::yield_now().await;
        assert!(!closer.is_finished());

        drop(held);
        closer.await.unwrap();

        assert!(matches!(
            repo.pending_count().await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_leaked_lease() {
        let repo = InMemoryMessageRepository::new(2, Duration::from_secs(1))
            .with_close_timeout(Duration::from_millis(200));
        let _leaked = repo.lease().await.unwrap();

        let started = tokio::time::Instant::now();
        repo.close().await;
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert!(matches!(
            repo.ingest(&packet("d", 1.0, "ok")).await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
