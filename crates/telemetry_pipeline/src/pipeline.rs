use crate::{HealthReport, IngestWorker, Ingestor};
use common::validation::SchemaValidator;
use common::{
    ConfigurationError, MessageId, MessagePage, MessageQuery, MessageRepository, PipelineConfig,
    QueryError, SubmitError,
};
use event_broadcaster::{EventBroadcaster, Subscription};
use message_processor::{DefaultActionExecutor, MessageProcessor, RuleSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use transport_connector::{BrokerLink, ConnectionState, TransportConnector};

/// Top-level assembly of the connector, persistence, processor and
/// broadcaster around one shared, hot-reloadable configuration.
pub struct Pipeline {
    config: watch::Sender<Arc<PipelineConfig>>,
    ingestor: Ingestor,
    repository: Arc<dyn MessageRepository>,
    connector: Arc<TransportConnector>,
    broadcaster: Arc<EventBroadcaster>,
    processor: Arc<MessageProcessor>,
}

impl Pipeline {
    /// Assemble with the standard derivation rules
    pub fn new(
        config: PipelineConfig,
        repository: Arc<dyn MessageRepository>,
        link: Arc<dyn BrokerLink>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_rules(config, repository, link, RuleSet::standard())
    }

    pub fn with_rules(
        config: PipelineConfig,
        repository: Arc<dyn MessageRepository>,
        link: Arc<dyn BrokerLink>,
        rules: RuleSet,
    ) -> Result<Self, ConfigurationError> {
        let config = config.validated()?;
        let (config_tx, config_rx) = watch::channel(Arc::new(config));

        let validator = Arc::new(SchemaValidator::new()?);
        let connector = Arc::new(TransportConnector::new(link, config_rx.clone()));
        let broadcaster = Arc::new(EventBroadcaster::new(config_rx.clone()));
        let executor = Arc::new(DefaultActionExecutor::new(
            connector.clone(),
            broadcaster.clone(),
            config_rx.clone(),
        ));
        let processor = Arc::new(MessageProcessor::new(
            repository.clone(),
            executor,
            rules,
            config_rx,
        ));

        Ok(Self {
            config: config_tx,
            ingestor: Ingestor::new(validator, repository.clone()),
            repository,
            connector,
            broadcaster,
            processor,
        })
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.borrow().clone()
    }

    /// Validate, store, then publish the packet to the publish topic.
    ///
    /// The publish is best effort: the packet is already durable and will be
    /// processed on a later tick whether or not the broker took it.
    #[instrument(skip_all)]
    pub async fn submit_packet(&self, raw: &[u8]) -> Result<MessageId, SubmitError> {
        let (id, packet) = self.ingestor.accept(raw).await?;

        let topic = self.config.borrow().publish_topic.clone();
        match serde_json::to_vec(&packet.to_json()) {
            Ok(payload) => {
                if let Err(e) = self.connector.publish(&topic, payload).await {
                    debug!(message_id = %id, topic = %topic, error = %e, "immediate publish skipped");
                }
            }
            Err(e) => warn!(message_id = %id, error = %e, "failed to encode packet for publish"),
        }

        info!(message_id = %id, device_id = packet.device_id(), "packet submitted");
        Ok(id)
    }

    /// Read-only query, independent of processing status. Bad parameters are
    /// rejected before storage is touched.
    pub async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage, QueryError> {
        query.field_filter()?;
        Ok(self.repository.query_messages(query).await?)
    }

    pub async fn health(&self) -> HealthReport {
        let pending_count = match self.repository.pending_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "failed to count pending messages");
                None
            }
        };

        HealthReport {
            connector_state: self.connector.state(),
            pending_count,
            last_tick_at: self.processor.last_tick_at(),
            subscriber_count: self.broadcaster.subscriber_count(),
            dropped_inbound: self.connector.dropped_inbound(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connector.watch_state()
    }

    /// Swap in a new configuration once it validates. On failure the running
    /// configuration is left untouched.
    pub fn reload_config(&self, candidate: PipelineConfig) -> Result<(), ConfigurationError> {
        let candidate = candidate.validated()?;

        let current = self.config();
        if *current == candidate {
            debug!("configuration unchanged");
            return Ok(());
        }

        let restart_only = current.restart_only_changes(&candidate);
        if !restart_only.is_empty() {
            warn!(fields = ?restart_only, "changed fields take effect after restart");
        }

        self.config.send_replace(Arc::new(candidate));
        info!("configuration reloaded");
        Ok(())
    }

    /// Run every worker until `token` is cancelled, then shut down in order:
    /// connector and inbound ingest, the in-flight tick, subscribers, storage.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        self.connector.connect().await;

        let ingest_token = CancellationToken::new();
        let processor_token = CancellationToken::new();
        let heartbeat_token = CancellationToken::new();

        let mut ingest = tokio::spawn(
            IngestWorker::new(self.ingestor.clone(), self.connector.clone())
                .run(ingest_token.clone()),
        );
        let mut scheduler = tokio::spawn(self.processor.clone().run(processor_token.clone()));
        let heartbeat = {
            let broadcaster = self.broadcaster.clone();
            let token = heartbeat_token.clone();
            tokio::spawn(async move { broadcaster.run_heartbeat(token).await })
        };

        info!("telemetry pipeline started");

        let mut failure = None;
        tokio::select! {
            _ = token.cancelled() => {}
            joined = &mut ingest => failure = Some(("ingest", flatten(joined))),
            joined = &mut scheduler => failure = Some(("scheduler", flatten(joined))),
        }

        info!("stopping telemetry pipeline");

        self.connector.shutdown().await;
        ingest_token.cancel();
        if !matches!(failure, Some(("ingest", _))) {
            log_join("ingest", ingest.await);
        }

        processor_token.cancel();
        if !matches!(failure, Some(("scheduler", _))) {
            log_join("scheduler", scheduler.await);
        }

        heartbeat_token.cancel();
        if let Err(e) = heartbeat.await {
            error!(error = %e, "heartbeat task panicked");
        }
        self.broadcaster.close_all();

        self.repository.close().await;
        info!("telemetry pipeline stopped");

        match failure {
            Some((worker, Err(e))) => Err(e.context(format!("{} worker failed", worker))),
            Some((worker, Ok(()))) => Err(anyhow::anyhow!("{} worker stopped unexpectedly", worker)),
            None => Ok(()),
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self: Arc<Self>,
    ) -> Box<
        dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
            + Send,
    > {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}

fn flatten(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    joined.map_err(anyhow::Error::from).and_then(|result| result)
}

fn log_join(worker: &str, joined: Result<anyhow::Result<()>, tokio::task::JoinError>) {
    if let Err(e) = flatten(joined) {
        error!(worker, error = ?e, "worker failed during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::memory::InMemoryMessageRepository;
    use common::{StatusClass, ValidationError};
    use transport_connector::testing::ScriptedBrokerLink;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            PipelineConfig::default(),
            Arc::new(InMemoryMessageRepository::default()),
            Arc::new(ScriptedBrokerLink::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PipelineConfig {
            batch_limit: 0,
            ..Default::default()
        };
        let result = Pipeline::new(
            config,
            Arc::new(InMemoryMessageRepository::default()),
            Arc::new(ScriptedBrokerLink::new()),
        );
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn test_reload_rejects_invalid_config_and_keeps_current() {
        let pipeline = pipeline();
        let before = pipeline.config();

        let candidate = PipelineConfig {
            backoff_base_ms: 10_000,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };
        let err = pipeline.reload_config(candidate).unwrap_err();

        assert!(matches!(err, ConfigurationError::Invalid(_)));
        assert_eq!(pipeline.config(), before);
    }

    #[test]
    fn test_reload_swaps_valid_config() {
        let pipeline = pipeline();

        let candidate = PipelineConfig {
            batch_limit: 25,
            pool_size: 3,
            ..Default::default()
        };
        pipeline.reload_config(candidate.clone()).unwrap();

        assert_eq!(*pipeline.config(), candidate);
    }

    #[tokio::test]
    async fn test_query_rejects_bad_parameters_as_client_error() {
        let pipeline = pipeline();

        let err = pipeline
            .query_messages(&MessageQuery::default().with_limit(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Validation(ValidationError::InvalidQuery(_))
        ));
        assert_eq!(err.status_class(), StatusClass::ClientError);
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let pipeline = pipeline();

        let report = pipeline.health().await;
        assert_eq!(report.connector_state, ConnectionState::Disconnected);
        assert_eq!(report.pending_count, Some(0));
        assert_eq!(report.last_tick_at, None);
        assert_eq!(report.subscriber_count, 0);
    }
}
