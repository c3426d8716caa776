use crate::BroadcastEvent;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::broadcaster::Registry;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<BroadcastEvent>,
    closed: bool,
}

/// Bounded FIFO for one subscriber; full queues drop their oldest event
pub(crate) struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `event`; returns the evicted event when the queue was full
    pub(crate) fn push(&self, event: BroadcastEvent) -> Option<BroadcastEvent> {
        let evicted = {
            let mut state = lock(&self.state);
            if state.closed {
                return None;
            }
            let evicted = if state.events.len() >= self.capacity {
                state.events.pop_front()
            } else {
                None
            };
            state.events.push_back(event);
            evicted
        };

        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub(crate) fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Result<BroadcastEvent, bool> {
        let mut state = lock(&self.state);
        match state.events.pop_front() {
            Some(event) => Ok(event),
            None => Err(state.closed),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).events.len()
    }
}

/// Output side of a subscriber, e.g. an HTTP response body
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &BroadcastEvent) -> Result<(), SinkError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Subscriber output failed: {0}")]
pub struct SinkError(pub String);

/// Handle for one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<SubscriberQueue>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, queue: Arc<SubscriberQueue>, registry: Weak<Registry>) -> Self {
        Self {
            id,
            queue,
            registry,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next queued event; `None` once the subscriber has been closed and
    /// everything queued before the close has been taken.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            let notified = self.queue.notify.notified();
            match self.queue.pop() {
                Ok(event) => return Some(event),
                Err(true) => return None,
                Err(false) => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.queue.pop().ok()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Events evicted from this subscriber's queue because it was full
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }

    /// Forward events to `sink` until the subscription closes or the sink
    /// fails. Either way the subscriber is removed on return.
    pub async fn forward_to<S: EventSink>(mut self, sink: &mut S) -> Result<(), SinkError> {
        while let Some(event) = self.recv().await {
            if let Err(e) = sink.send(&event).await {
                debug!(subscriber_id = %self.id, error = %e, "subscriber output failed, removing");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
