use crate::{ActionExecutor, RuleSet};
use chrono::{DateTime, Utc};
use common::{
    Action, ActionExecutionError, ConfigWatch, MessageId, MessageRepository, ProcessingOutcome,
    StorageError,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{Id as TaskId, JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Phase of the tick currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Fetching,
    Dispatching,
    Settling,
}

/// Counters for one completed tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub actions: usize,
    pub failed_actions: usize,
    pub succeeded: usize,
    pub partially_failed: usize,
    /// Messages whose outcome could not be recorded; fetched again next tick
    pub unsettled: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running
    Skipped,
    FetchFailed(StorageError),
}

/// Pulls unprocessed messages on a fixed interval, executes the actions the
/// rules derive from them and records each message's outcome.
pub struct MessageProcessor {
    repository: Arc<dyn MessageRepository>,
    executor: Arc<dyn ActionExecutor>,
    rules: RuleSet,
    config: ConfigWatch,
    tick_guard: Mutex<()>,
    phase: watch::Sender<TickPhase>,
    last_tick_at: watch::Sender<Option<DateTime<Utc>>>,
}

impl MessageProcessor {
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        executor: Arc<dyn ActionExecutor>,
        rules: RuleSet,
        config: ConfigWatch,
    ) -> Self {
        Self {
            repository,
            executor,
            rules,
            config,
            tick_guard: Mutex::new(()),
            phase: watch::channel(TickPhase::Idle).0,
            last_tick_at: watch::channel(None).0,
        }
    }

    pub fn phase(&self) -> TickPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<TickPhase> {
        self.phase.subscribe()
    }

    /// Completion time of the last tick that reached `Settling`
    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_at.borrow()
    }

    /// Run one fetch, dispatch, settle cycle. Returns `Skipped` without
    /// touching storage if another tick has not returned to `Idle`.
    #[instrument(name = "processor_tick", skip_all)]
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            info!("previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let config = self.config.borrow().clone();

        self.phase.send_replace(TickPhase::Fetching);
        let messages = match self.repository.fetch_unprocessed(config.batch_limit).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "failed to fetch unprocessed messages");
                self.phase.send_replace(TickPhase::Idle);
                return TickOutcome::FetchFailed(e);
            }
        };

        let mut report = TickReport {
            fetched: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            debug!("no unprocessed messages");
        }

        self.phase.send_replace(TickPhase::Dispatching);
        let actions: Vec<Action> = messages
            .iter()
            .flat_map(|message| self.rules.derive(message, &config))
            .collect();
        report.actions = actions.len();
        let failures = self.dispatch(actions, config.max_concurrency).await;
        report.failed_actions = failures.values().sum();

        self.phase.send_replace(TickPhase::Settling);
        for message in &messages {
            let outcome = if failures.contains_key(&message.id) {
                ProcessingOutcome::PartialFailure
            } else {
                ProcessingOutcome::Success
            };

            match self.repository.mark_processed(message.id, outcome).await {
                Ok(()) => match outcome {
                    ProcessingOutcome::PartialFailure => report.partially_failed += 1,
                    _ => report.succeeded += 1,
                },
                Err(e) => {
                    error!(
                        message_id = %message.id,
                        outcome = %outcome,
                        error = %e,
                        "failed to record outcome, message stays unprocessed"
                    );
                    report.unsettled += 1;
                }
            }
        }

        self.last_tick_at.send_replace(Some(Utc::now()));
        self.phase.send_replace(TickPhase::Idle);

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                actions = report.actions,
                failed_actions = report.failed_actions,
                partially_failed = report.partially_failed,
                unsettled = report.unsettled,
                "tick completed"
            );
        }
        TickOutcome::Completed(report)
    }

    /// Execute every action, at most `max_concurrency` at once, starting
    /// them in the given order. Returns failed-action counts per message.
    async fn dispatch(
        &self,
        actions: Vec<Action>,
        max_concurrency: usize,
    ) -> HashMap<MessageId, usize> {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        let mut owners: HashMap<TaskId, MessageId> = HashMap::new();

        for action in actions {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = self.executor.clone();
            let message_id = action.message_id;
            let handle = join_set.spawn(async move {
                let _permit = permit;
                let result = AssertUnwindSafe(async { executor.execute(&action).await })
                    .catch_unwind()
                    .await
                    .unwrap_or(Err(ActionExecutionError::Panicked));
                (action, result)
            });
            owners.insert(handle.id(), message_id);
        }

        let mut failures: HashMap<MessageId, usize> = HashMap::new();
        while let Some(joined) = join_set.join_next_with_id().await {
            tally(joined, &owners, &mut failures);
        }
        failures
    }

    /// Fire [`MessageProcessor::tick`] every `processing_interval` until
    /// cancelled, then wait up to `shutdown_grace` for the in-flight tick.
    ///
    /// Each tick runs in its own task so a panic is contained and logged.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let mut period = self.config.borrow().processing_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<TickOutcome>> = None;

        info!(interval_ms = period.as_millis() as u64, "message processor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(handle) = in_flight.take() {
                if handle.is_finished() {
                    reap(handle).await;
                } else {
                    info!("previous tick still running, skipping");
                    in_flight = Some(handle);
                    continue;
                }
            }

            let processor = self.clone();
            in_flight = Some(tokio::spawn(async move { processor.tick().await }));

            let configured = self.config.borrow().processing_interval();
            if configured != period {
                info!(interval_ms = configured.as_millis() as u64, "processing interval changed");
                period = configured;
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }

        if let Some(mut handle) = in_flight {
            let grace = self.config.borrow().shutdown_grace();
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(_)) => debug!("in-flight tick finished before shutdown"),
                Ok(Err(e)) => error!(error = %e, "in-flight tick panicked during shutdown"),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "in-flight tick exceeded shutdown grace, abandoning");
                    handle.abort();
                    self.phase.send_replace(TickPhase::Idle);
                }
            }
        }

        info!("message processor stopped");
        Ok(())
    }
}

async fn reap(handle: JoinHandle<TickOutcome>) {
    if let Err(e) = handle.await {
        error!(error = %e, "tick panicked");
    }
}

type ActionJoin = Result<(TaskId, (Action, Result<(), ActionExecutionError>)), JoinError>;

/// Count a failure against the owning message for a failed or aborted action
fn tally(
    joined: ActionJoin,
    owners: &HashMap<TaskId, MessageId>,
    failures: &mut HashMap<MessageId, usize>,
) {
    match joined {
        Ok((_, (action, Ok(())))) => {
            debug!(message_id = %action.message_id, rule = action.rule, kind = action.kind.label(), "action succeeded");
        }
        Ok((_, (action, Err(e)))) => {
            warn!(
                message_id = %action.message_id,
                rule = action.rule,
                kind = action.kind.label(),
                error = %e,
                "action failed"
            );
            *failures.entry(action.message_id).or_default() += 1;
        }
        Err(e) => match owners.get(&e.id()) {
            Some(message_id) => {
                error!(message_id = %message_id, error = %e, "action task aborted");
                *failures.entry(*message_id).or_default() += 1;
            }
            None => error!(error = %e, "action task aborted"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockActionExecutor;
    use async_trait::async_trait;
    use common::memory::InMemoryMessageRepository;
    use common::validation::SchemaValidator;
    use common::{ActionKind, MessageQuery, MockMessageRepository, PipelineConfig, StoredMessage};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config_with(update: impl FnOnce(&mut PipelineConfig)) -> ConfigWatch {
        let mut config = PipelineConfig {
            processing_interval_ms: 100,
            max_concurrency: 4,
            shutdown_grace_ms: 500,
            ..Default::default()
        };
        update(&mut config);
        watch::channel(Arc::new(config)).1
    }

    fn raw(device_id: &str) -> serde_json::Value {
        json!({
            "device_id": device_id,
            "timestamp": "2024-05-01T12:00:00Z",
            "measurements": {"temperature": 72.3},
            "status": "ok",
            "battery_level": 88
        })
    }

    async fn repository_with(devices: &[&str]) -> Arc<InMemoryMessageRepository> {
        let validator = SchemaValidator::new().unwrap();
        let repository = Arc::new(InMemoryMessageRepository::default());
        for device in devices {
            let packet = validator.validate_value(raw(device)).unwrap();
            repository.ingest(&packet).await.unwrap();
        }
        repository
    }

    async fn stored(device_id: &str) -> StoredMessage {
        let repository = repository_with(&[device_id]).await;
        repository.fetch_unprocessed(1).await.unwrap().remove(0)
    }

    fn echo_device_rules() -> RuleSet {
        RuleSet::empty().with_rule("echo_device", |message, _config| {
            vec![ActionKind::SseBroadcast {
                event: json!({ "device_id": message.packet.device_id() }),
            }]
        })
    }

    fn device_of(action: &Action) -> String {
        match &action.kind {
            ActionKind::SseBroadcast { event } => event["device_id"].as_str().unwrap_or_default().to_string(),
            _ => String::new(),
        }
    }

    /// Blocks every action until the test adds permits
    struct GatedExecutor {
        gate: Semaphore,
        started: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for GatedExecutor {
        async fn execute(&self, _action: &Action) -> Result<(), ActionExecutionError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(())
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl ActionExecutor for PanickingExecutor {
        async fn execute(&self, _action: &Action) -> Result<(), ActionExecutionError> {
            panic!("executor blew up");
        }
    }

    /// Records the order actions start in and the peak concurrency
    #[derive(Default)]
    struct RecordingExecutor {
        started: std::sync::Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(&self, action: &Action) -> Result<(), ActionExecutionError> {
            self.started.lock().unwrap().push(device_of(action));
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tick_without_matching_rules_marks_success() {
        let repository = repository_with(&["esp32-1"]).await;
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().times(0);

        let processor = MessageProcessor::new(
            repository.clone(),
            Arc::new(executor),
            RuleSet::empty(),
            config_with(|_| {}),
        );

        let outcome = processor.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickReport {
                fetched: 1,
                succeeded: 1,
                ..Default::default()
            })
        );
        assert!(repository.fetch_unprocessed(10).await.unwrap().is_empty());

        let page = repository
            .query_messages(&MessageQuery::default())
            .await
            .unwrap();
        assert!(page.items[0].processed);
        assert_eq!(page.items[0].processing_outcome, ProcessingOutcome::Success);
        assert!(processor.last_tick_at().is_some());
        assert_eq!(processor.phase(), TickPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_action_marks_only_its_message_partial() {
        let repository = repository_with(&["good", "bad"]).await;
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().times(2).returning(|action| {
            if device_of(action) == "bad" {
                Err(ActionExecutionError::Publish(common::PublishError::NotConnected))
            } else {
                Ok(())
            }
        });

        let processor = MessageProcessor::new(
            repository.clone(),
            Arc::new(executor),
            echo_device_rules(),
            config_with(|_| {}),
        );

        let TickOutcome::Completed(report) = processor.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.failed_actions, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.partially_failed, 1);

        let page = repository
            .query_messages(&MessageQuery::default())
            .await
            .unwrap();
        let outcome_of = |device: &str| {
            page.items
                .iter()
                .find(|m| m.packet.device_id() == device)
                .map(|m| m.processing_outcome)
        };
        assert_eq!(outcome_of("good"), Some(ProcessingOutcome::Success));
        assert_eq!(outcome_of("bad"), Some(ProcessingOutcome::PartialFailure));
        assert!(repository.fetch_unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_action_is_contained() {
        let repository = repository_with(&["esp32-1"]).await;
        let processor = MessageProcessor::new(
            repository.clone(),
            Arc::new(PanickingExecutor),
            echo_device_rules(),
            config_with(|_| {}),
        );

        let TickOutcome::Completed(report) = processor.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.partially_failed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_tick_is_skipped_without_fetching() {
        let message = stored("esp32-1").await;
        let mut repository = MockMessageRepository::new();
        repository
            .expect_fetch_unprocessed()
            .times(1)
            .returning(move |_| Ok(vec![message.clone()]));
        repository
            .expect_mark_processed()
            .times(1)
            .returning(|_, _| Ok(()));

        let executor = Arc::new(GatedExecutor {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        });
        let processor = Arc::new(MessageProcessor::new(
            Arc::new(repository),
            executor.clone(),
            echo_device_rules(),
            config_with(|_| {}),
        ));

        let mut phases = processor.watch_phase();
        let first = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.tick().await })
        };
        phases
            .wait_for(|phase| *phase == TickPhase::Dispatching)
            .await
            .unwrap();

        assert_eq!(processor.tick().await, TickOutcome::Skipped);

        executor.gate.add_permits(1);
        assert!(matches!(first.await.unwrap(), TickOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_failed_settle_leaves_message_for_next_tick() {
        let message = stored("esp32-1").await;
        let mut repository = MockMessageRepository::new();
        repository
            .expect_fetch_unprocessed()
            .returning(move |_| Ok(vec![message.clone()]));
        repository
            .expect_mark_processed()
            .times(1)
            .returning(|_, _| Err(StorageError::Unavailable("connection reset".to_string())));

        let processor = MessageProcessor::new(
            Arc::new(repository),
            Arc::new(MockActionExecutor::new()),
            RuleSet::empty(),
            config_with(|_| {}),
        );

        let TickOutcome::Completed(report) = processor.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.unsettled, 1);
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported() {
        let mut repository = MockMessageRepository::new();
        repository
            .expect_fetch_unprocessed()
            .returning(|_| Err(StorageError::PoolExhausted(Duration::from_secs(1))));
        repository.expect_mark_processed().times(0);

        let processor = MessageProcessor::new(
            Arc::new(repository),
            Arc::new(MockActionExecutor::new()),
            RuleSet::empty(),
            config_with(|_| {}),
        );

        assert!(matches!(
            processor.tick().await,
            TickOutcome::FetchFailed(StorageError::PoolExhausted(_))
        ));
        assert_eq!(processor.phase(), TickPhase::Idle);
        assert!(processor.last_tick_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_respects_order_and_concurrency_bound() {
        let devices = ["d1", "d2", "d3", "d4", "d5", "d6"];
        let repository = repository_with(&devices).await;
        let executor = Arc::new(RecordingExecutor::default());

        let processor = MessageProcessor::new(
            repository,
            executor.clone(),
            echo_device_rules(),
            config_with(|c| c.max_concurrency = 2),
        );
        processor.tick().await;

        assert_eq!(*executor.started.lock().unwrap(), devices.to_vec());
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_aborted_action_counts_against_its_message() {
        let message_id = MessageId::new(7);
        let mut join_set: JoinSet<(Action, Result<(), ActionExecutionError>)> = JoinSet::new();
        let handle = join_set.spawn(std::future::pending());
        let owners = HashMap::from([(handle.id(), message_id)]);
        handle.abort();

        let mut failures = HashMap::new();
        while let Some(joined) = join_set.join_next_with_id().await {
            assert!(joined.as_ref().is_err_and(|e| e.is_cancelled()));
            tally(joined, &owners, &mut failures);
        }

        assert_eq!(failures.get(&message_id), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_processes_on_interval_and_stops() {
        let repository = repository_with(&["esp32-1"]).await;
        let processor = Arc::new(MessageProcessor::new(
            repository.clone(),
            Arc::new(MockActionExecutor::new()),
            RuleSet::empty(),
            config_with(|_| {}),
        ));
        let token = CancellationToken::new();
        let scheduler = tokio::spawn(processor.clone().run(token.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(repository.pending_count().await.unwrap(), 0);
        assert!(processor.last_tick_at().is_some());

        token.cancel();
        assert!(scheduler.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_tick_after_grace() {
        let repository = repository_with(&["esp32-1"]).await;
        let executor = Arc::new(GatedExecutor {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        });
        let processor = Arc::new(MessageProcessor::new(
            repository.clone(),
            executor.clone(),
            echo_device_rules(),
            config_with(|_| {}),
        ));
        let token = CancellationToken::new();
        let scheduler = tokio::spawn(processor.clone().run(token.clone()));

        let mut phases = processor.watch_phase();
        phases
            .wait_for(|phase| *phase == TickPhase::Dispatching)
            .await
            .unwrap();

        token.cancel();
        assert!(scheduler.await.unwrap().is_ok());

        assert_eq!(executor.started.load(Ordering::SeqCst), 1);
        assert_eq!(processor.phase(), TickPhase::Idle);
        assert_eq!(repository.pending_count().await.unwrap(), 1);
    }
}
