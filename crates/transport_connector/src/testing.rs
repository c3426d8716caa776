//! In-process broker link for tests. Sessions are scripted up front and
//! driven from the test through [`ScriptedSession`].

use crate::{BrokerLink, BrokerSession, InboundPayload, SessionEvents, SessionPublisher};
use async_trait::async_trait;
use chrono::Utc;
use common::{ConnectivityError, PublishError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

enum ScriptedOpen {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<InboundPayload>),
}

type PublishLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// Broker link whose `open` calls consume a queue of scripted outcomes.
/// Once the queue is empty every attempt is refused.
#[derive(Default)]
pub struct ScriptedBrokerLink {
    script: Mutex<VecDeque<ScriptedOpen>>,
    published: PublishLog,
    subscriptions: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    reject_publishes: Arc<Mutex<bool>>,
    stall_publishes: Arc<Mutex<bool>>,
}

impl ScriptedBrokerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next attempt fails with `reason`
    pub async fn refuse(&self, reason: &str) {
        self.script
            .lock()
            .await
            .push_back(ScriptedOpen::Refuse(reason.to_string()));
    }

    /// Next attempt succeeds. The session lives until the handle is dropped.
    pub async fn accept_session(&self) -> ScriptedSession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().await.push_back(ScriptedOpen::Accept(rx));
        ScriptedSession { tx }
    }

    /// Make every publish on every session fail with `BrokerRejected`
    pub async fn reject_publishes(&self, reject: bool) {
        *self.reject_publishes.lock().await = reject;
    }

    /// Make every publish hang until the session goes away
    pub async fn stall_publishes(&self, stall: bool) {
        *self.stall_publishes.lock().await = stall;
    }

    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerLink for ScriptedBrokerLink {
    async fn open(&self, subscribe_topic: &str) -> Result<BrokerSession, ConnectivityError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().await.pop_front();
        match next {
            Some(ScriptedOpen::Accept(rx)) => {
                self.subscriptions
                    .lock()
                    .await
                    .push(subscribe_topic.to_string());
                Ok(BrokerSession {
                    publisher: Arc::new(ScriptedPublisher {
                        published: self.published.clone(),
                        reject: self.reject_publishes.clone(),
                        stall: self.stall_publishes.clone(),
                    }),
                    events: Box::new(ScriptedEvents { rx }),
                })
            }
            Some(ScriptedOpen::Refuse(reason)) => Err(ConnectivityError(reason)),
            None => Err(ConnectivityError("no scripted session".to_string())),
        }
    }
}

/// Test-side handle of an accepted session
pub struct ScriptedSession {
    tx: mpsc::UnboundedSender<InboundPayload>,
}

impl ScriptedSession {
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let _ = self.tx.send(InboundPayload {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            received_at: Utc::now(),
        });
    }
}

struct ScriptedPublisher {
    published: PublishLog,
    reject: Arc<Mutex<bool>>,
    stall: Arc<Mutex<bool>>,
}

#[async_trait]
impl SessionPublisher for ScriptedPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if *self.stall.lock().await {
            std::future::pending::<()>().await;
        }
        if *self.reject.lock().await {
            return Err(PublishError::BrokerRejected("scripted rejection".to_string()));
        }
        self.published.lock().await.push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) {}
}

struct ScriptedEvents {
    rx: mpsc::UnboundedReceiver<InboundPayload>,
}

#[async_trait]
impl SessionEvents for ScriptedEvents {
    async fn next(&mut self) -> Result<InboundPayload, ConnectivityError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ConnectivityError("scripted session closed".to_string()))
    }
}
