use crate::subscription::{lock, SubscriberQueue};
use crate::{BroadcastEvent, SubscriberId, Subscription};
use chrono::Utc;
use common::ConfigWatch;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Active subscriber set shared with every [`Subscription`]
pub(crate) struct Registry {
    subscribers: Mutex<BTreeMap<SubscriberId, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Registry {
    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let removed = lock(&self.subscribers).remove(&id);
        match removed {
            Some(queue) => {
                queue.close();
                debug!(subscriber_id = %id, "subscriber removed");
                true
            }
            None => false,
        }
    }
}

/// Fan-out hub for SSE-style subscribers.
///
/// Every subscriber owns a bounded queue. `broadcast` never waits on a slow
/// subscriber: a full queue loses its oldest event instead.
pub struct EventBroadcaster {
    registry: Arc<Registry>,
    config: ConfigWatch,
}

impl EventBroadcaster {
    pub fn new(config: ConfigWatch) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
            config,
        }
    }

    /// Register a subscriber with a queue sized from the current config.
    ///
    /// After [`EventBroadcaster::close_all`] the returned subscription is
    /// already closed.
    pub fn subscribe(&self) -> Subscription {
        let capacity = self.config.borrow().broadcaster_queue_size;
        let id = SubscriberId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SubscriberQueue::new(capacity));

        if self.registry.closed.load(Ordering::Acquire) {
            queue.close();
        } else {
            lock(&self.registry.subscribers).insert(id, queue.clone());
            debug!(subscriber_id = %id, capacity, "subscriber added");
        }

        Subscription::new(id, queue, Arc::downgrade(&self.registry))
    }

    /// Returns whether `id` was still active
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.remove(id)
    }

    /// Enqueue `event` on every active subscriber; returns how many received it
    pub fn broadcast(&self, event: BroadcastEvent) -> usize {
        // Pushing under the registry lock keeps one global order across subscribers
        let subscribers = lock(&self.registry.subscribers);
        for (id, queue) in subscribers.iter() {
            if let Some(evicted) = queue.push(event.clone()) {
                warn!(
                    subscriber_id = %id,
                    evicted_event = evicted.event_name(),
                    dropped_total = queue.dropped(),
                    "subscriber queue full, dropped oldest event"
                );
            }
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry.subscribers).len()
    }

    /// Evicted-event counter for an active subscriber
    pub fn dropped_events(&self, id: SubscriberId) -> Option<u64> {
        lock(&self.registry.subscribers)
            .get(&id)
            .map(|queue| queue.dropped())
    }

    /// Send a final `Close` event to every subscriber, then remove them all.
    /// Later subscriptions are closed on arrival.
    pub fn close_all(&self) {
        self.registry.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *lock(&self.registry.subscribers));
        for queue in drained.values() {
            queue.push(BroadcastEvent::Close);
            queue.close();
        }
        info!(subscribers = drained.len(), "closed all subscribers");
    }

    /// Broadcast a heartbeat every `heartbeat_interval` until cancelled.
    /// The interval is re-read after each beat so reloads apply.
    pub async fn run_heartbeat(&self, token: CancellationToken) {
        loop {
            let interval = self.config.borrow().heartbeat_interval();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let delivered = self.broadcast(BroadcastEvent::Heartbeat { at: Utc::now() });
                    debug!(subscribers = delivered, "heartbeat sent");
                }
            }
        }
        debug!("heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventSink, SinkError};
    use async_trait::async_trait;
    use common::PipelineConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    fn broadcaster(queue_size: usize) -> EventBroadcaster {
        let config = PipelineConfig {
            broadcaster_queue_size: queue_size,
            heartbeat_interval_ms: 1_000,
            ..Default::default()
        };
        let (_, rx) = watch::channel(Arc::new(config));
        EventBroadcaster::new(rx)
    }

    fn message(n: u64) -> BroadcastEvent {
        BroadcastEvent::Message(json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let broadcaster = broadcaster(2);
        let mut subscription = broadcaster.subscribe();

        broadcaster.broadcast(message(1));
        broadcaster.broadcast(message(2));
        broadcaster.broadcast(message(3));

        assert_eq!(subscription.queued(), 2);
        assert_eq!(subscription.dropped_events(), 1);
        assert_eq!(subscription.try_recv(), Some(message(2)));
        assert_eq!(subscription.try_recv(), Some(message(3)));
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscriber() {
        let broadcaster = broadcaster(16);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        for n in 0..5 {
            assert_eq!(broadcaster.broadcast(message(n)), 2);
        }

        for n in 0..5 {
            assert_eq!(first.recv().await, Some(message(n)));
            assert_eq!(second.recv().await, Some(message(n)));
        }
    }

    #[tokio::test]
    async fn test_recv_wakes_on_broadcast() {
        let broadcaster = Arc::new(broadcaster(4));
        let mut subscription = broadcaster.subscribe();

        let sender = broadcaster.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            sender.broadcast(message(7));
        });

        assert_eq!(subscription.recv().await, Some(message(7)));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broadcaster = broadcaster(4);
        let subscription = broadcaster.subscribe();
        let id = subscription.id();
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.dropped_events(id), Some(0));

        drop(subscription);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(!broadcaster.unsubscribe(id));
        assert_eq!(broadcaster.broadcast(message(1)), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream_after_queued_events() {
        let broadcaster = broadcaster(4);
        let mut subscription = broadcaster.subscribe();
        broadcaster.broadcast(message(1));

        assert!(broadcaster.unsubscribe(subscription.id()));
        broadcaster.broadcast(message(2));

        assert_eq!(subscription.recv().await, Some(message(1)));
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_all_sends_close_then_removes() {
        let broadcaster = broadcaster(2);
        let mut subscription = broadcaster.subscribe();
        broadcaster.broadcast(message(1));
        broadcaster.broadcast(message(2));

        broadcaster.close_all();

        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(subscription.recv().await, Some(message(2)));
        assert_eq!(subscription.recv().await, Some(BroadcastEvent::Close));
        assert_eq!(subscription.recv().await, None);

        let mut late = broadcaster.subscribe();
        assert_eq!(late.recv().await, None);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reaches_subscribers() {
        let broadcaster = Arc::new(broadcaster(8));
        let mut subscription = broadcaster.subscribe();
        let token = CancellationToken::new();

        let heartbeat = {
            let broadcaster = broadcaster.clone();
            let token = token.clone();
            tokio::spawn(async move { broadcaster.run_heartbeat(token).await })
        };

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.event_name(), "ping");

        token.cancel();
        heartbeat.await.unwrap();
    }

    struct FailingSink {
        accepted: usize,
        fail_after: usize,
    }

    #[async_trait]
    impl EventSink for FailingSink {
        async fn send(&mut self, _event: &BroadcastEvent) -> Result<(), SinkError> {
            if self.accepted == self.fail_after {
                return Err(SinkError("peer disconnected".to_string()));
            }
            self.accepted += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_sink_removes_subscriber() {
        let broadcaster = broadcaster(8);
        let subscription = broadcaster.subscribe();
        broadcaster.broadcast(message(1));
        broadcaster.broadcast(message(2));

        let mut sink = FailingSink {
            accepted: 0,
            fail_after: 1,
        };
        let result = subscription.forward_to(&mut sink).await;

        assert!(result.is_err());
        assert_eq!(sink.accepted, 1);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_pending_until_event() {
        let broadcaster = broadcaster(2);
        let mut subscription = broadcaster.subscribe();

        let waited = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
        assert!(waited.is_err());
    }
}
