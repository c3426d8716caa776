use crate::{Backoff, BrokerLink, ConnectionState, InboundPayload, SessionEvents, SessionPublisher};
use async_trait::async_trait;
use chrono::Utc;
use common::{ConfigWatch, ConnectivityError, PublishAck, PublishError, TelemetryPublisher};
use futures::Stream;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

type PublisherSlot = Arc<RwLock<Option<Arc<dyn SessionPublisher>>>>;
type ReceiverSlot = Arc<StdMutex<Option<mpsc::Receiver<InboundPayload>>>>;

/// Holds the single logical connection to the broker.
///
/// `connect` starts a connection worker that owns the state machine
/// `Disconnected -> Connecting -> Connected`, falling into `Backoff` on any
/// failure. Only the worker opens sessions, so attempts never overlap.
///
/// The worker never waits on the inbound queue: when it is full the newest
/// payload is dropped and counted so the broker session keeps being polled.
pub struct TransportConnector {
    link: Arc<dyn BrokerLink>,
    config: ConfigWatch,
    state: Arc<watch::Sender<ConnectionState>>,
    publisher: PublisherSlot,
    inbound_tx: mpsc::Sender<InboundPayload>,
    inbound_rx: ReceiverSlot,
    dropped_inbound: Arc<AtomicU64>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TransportConnector {
    pub fn new(link: Arc<dyn BrokerLink>, config: ConfigWatch) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            link,
            config,
            state: Arc::new(state),
            publisher: Arc::new(RwLock::new(None)),
            inbound_tx,
            inbound_rx: Arc::new(StdMutex::new(Some(inbound_rx))),
            dropped_inbound: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Start the connection worker. A no-op while one is already running.
    pub async fn connect(&self) {
        let mut worker = self.worker.lock().await;
        if let Some((_, handle)) = worker.as_ref() {
            if !handle.is_finished() {
                debug!("connection worker already running");
                return;
            }
        }

        let token = CancellationToken::new();
        let session_worker = SessionWorker {
            link: self.link.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            publisher: self.publisher.clone(),
            inbound_tx: self.inbound_tx.clone(),
            dropped_inbound: self.dropped_inbound.clone(),
        };
        let handle = tokio::spawn(session_worker.run(token.clone()));
        *worker = Some((token, handle));
    }

    /// Stop the worker and close the session. State ends `Disconnected`
    /// until `connect` is called again.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().await.take();
        if let Some((token, handle)) = worker {
            token.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "connection worker panicked");
            }
        }
        self.publisher.write().await.take();
        self.state.send_replace(ConnectionState::Disconnected);
        info!("transport connector stopped");
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Inbound payloads dropped because the inbound queue was full
    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    /// Stream of raw inbound payloads across reconnects.
    ///
    /// Only one stream exists at a time; dropping it hands the underlying
    /// queue back so a later call can resume where it stopped. Returns `None`
    /// while another stream is live.
    pub fn on_message(&self) -> Option<InboundStream> {
        let receiver = match self.inbound_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        receiver.map(|rx| InboundStream {
            rx: Some(rx),
            slot: self.inbound_rx.clone(),
        })
    }

    /// Publish on the live session. Fails immediately with
    /// [`PublishError::NotConnected`] when there is none, and with
    /// [`PublishError::BrokerRejected`] when the session does not take the
    /// message within `connect_timeout`.
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, PublishError> {
        let publisher = self.publisher.read().await.clone();
        let publisher = publisher.ok_or(PublishError::NotConnected)?;

        let payload_size = payload.len();
        let bound = self.config.borrow().connect_timeout();
        tokio::time::timeout(bound, publisher.publish(topic, payload))
            .await
            .map_err(|_| {
                PublishError::BrokerRejected(format!(
                    "publish not accepted within {}ms",
                    bound.as_millis()
                ))
            })??;
        Ok(PublishAck {
            topic: topic.to_string(),
            payload_size,
        })
    }
}

#[async_trait]
impl TelemetryPublisher for TransportConnector {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishAck, PublishError> {
        TransportConnector::publish(self, topic, payload).await
    }
}

enum SessionEnd {
    Cancelled,
    Lost(ConnectivityError),
}

struct SessionWorker {
    link: Arc<dyn BrokerLink>,
    config: ConfigWatch,
    state: Arc<watch::Sender<ConnectionState>>,
    publisher: PublisherSlot,
    inbound_tx: mpsc::Sender<InboundPayload>,
    dropped_inbound: Arc<AtomicU64>,
}

impl SessionWorker {
    async fn run(self, token: CancellationToken) {
        let mut backoff = Backoff::from_config(&self.config.borrow());
        let mut rng = StdRng::from_entropy();

        loop {
            let config = self.config.borrow().clone();
            backoff.reconfigure(&config);

            self.state.send_replace(ConnectionState::Connecting);
            let opened = tokio::select! {
                _ = token.cancelled() => break,
                opened = tokio::time::timeout(config.connect_timeout(), self.link.open(&config.subscribe_topic)) => opened,
            };

            match opened {
                Ok(Ok(session)) => {
                    *self.publisher.write().await = Some(session.publisher.clone());
                    self.state.send_replace(ConnectionState::Connected);
                    info!(topic = %config.subscribe_topic, "connected to broker");

                    let end = self.pump(session.events, &token, &mut backoff).await;
                    self.publisher.write().await.take();

                    match end {
                        SessionEnd::Cancelled => {
                            session.publisher.disconnect().await;
                            break;
                        }
                        SessionEnd::Lost(e) => warn!(error = %e, "broker session lost"),
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "broker connection attempt failed"),
                Err(_) => warn!(
                    timeout_ms = config.connect_timeout_ms,
                    "broker connection attempt timed out"
                ),
            }

            let delay = backoff.next_delay(&mut rng);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.state.send_replace(ConnectionState::Backoff {
                attempt: backoff.attempt(),
                next_retry_at,
            });
            debug!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect"
            );

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.publisher.write().await.take();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Forward inbound payloads until the session ends. Resets the backoff
    /// once the session has stayed up for the stable-connection window.
    async fn pump(
        &self,
        mut events: Box<dyn SessionEvents>,
        token: &CancellationToken,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let stable_window = self.config.borrow().stable_connection_window();
        let stable = tokio::time::sleep(stable_window);
        tokio::pin!(stable);
        let mut stable_reached = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => return SessionEnd::Cancelled,
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    if backoff.attempt() > 0 {
                        debug!("connection stable, resetting backoff");
                    }
                    backoff.reset();
                }
                next = events.next() => match next {
                    Ok(payload) => self.forward(payload),
                    Err(e) => return SessionEnd::Lost(e),
                },
            }
        }
    }

    fn forward(&self, payload: InboundPayload) {
        match self.inbound_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(payload)) => {
                let dropped = self.dropped_inbound.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    topic = %payload.topic,
                    dropped,
                    "inbound queue full, dropping payload"
                );
            }
            Err(TrySendError::Closed(_)) => warn!("inbound queue closed, dropping payload"),
        }
    }
}

/// Restartable sequence of raw inbound payloads
pub struct InboundStream {
    rx: Option<mpsc::Receiver<InboundPayload>>,
    slot: ReceiverSlot,
}

impl InboundStream {
    pub async fn next(&mut self) -> Option<InboundPayload> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Stream for InboundStream {
    type Item = InboundPayload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            match self.slot.lock() {
                Ok(mut slot) => *slot = Some(rx),
                Err(poisoned) => *poisoned.into_inner() = Some(rx),
            }
        }
    }
}
