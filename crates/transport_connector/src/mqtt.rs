use crate::{BrokerLink, BrokerSession, InboundPayload, SessionEvents, SessionPublisher};
use async_trait::async_trait;
use chrono::Utc;
use common::{ConfigurationError, ConnectivityError, PublishError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// MQTT broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// `mqtt://host:port`, `tcp://host:port` or `host:port`
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "thistle-pipeline".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ConfigurationError> {
    let stripped = url.trim_start_matches("mqtt://").trim_start_matches("tcp://");

    let parts: Vec<&str> = stripped.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((host.to_string(), 1883)),
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                ConfigurationError::Invalid(format!("Invalid port in broker URL: {}", port))
            })?;
            Ok((host.to_string(), port))
        }
        _ => Err(ConfigurationError::Invalid(format!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}

/// [`BrokerLink`] backed by rumqttc. Each `open` builds a fresh client and
/// event loop with a clean session.
pub struct MqttBrokerLink {
    config: MqttConfig,
    host: String,
    port: u16,
}

impl MqttBrokerLink {
    pub fn new(config: MqttConfig) -> Result<Self, ConfigurationError> {
        let (host, port) = parse_broker_url(&config.broker_url)?;
        if config.username.is_some() != config.password.is_some() {
            return Err(ConfigurationError::Invalid(
                "MQTT username and password must be set together".to_string(),
            ));
        }
        Ok(Self { config, host, port })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.config.client_id, &self.host, self.port);
        options.set_keep_alive(self.config.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        {
            options.set_credentials(username, password);
        }
        options
    }
}

fn connectivity(e: impl std::fmt::Display) -> ConnectivityError {
    ConnectivityError(e.to_string())
}

fn to_inbound(publish: Publish) -> InboundPayload {
    InboundPayload {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
        received_at: Utc::now(),
    }
}

#[async_trait]
impl BrokerLink for MqttBrokerLink {
    #[instrument(name = "mqtt_open", skip(self), fields(host = %self.host, port = self.port))]
    async fn open(&self, subscribe_topic: &str) -> Result<BrokerSession, ConnectivityError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);

        loop {
            match eventloop.poll().await.map_err(connectivity)? {
                Event::Incoming(Packet::ConnAck(_)) => break,
                _ => continue,
            }
        }
        debug!("connected to MQTT broker");

        client
            .subscribe(subscribe_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ConnectivityError(format!("Failed to subscribe: {}", e)))?;

        // Anything published to us before the SubAck is kept for the session
        let mut buffered = VecDeque::new();
        loop {
            match eventloop.poll().await.map_err(connectivity)? {
                Event::Incoming(Packet::SubAck(_)) => break,
                Event::Incoming(Packet::Publish(publish)) => buffered.push_back(to_inbound(publish)),
                _ => continue,
            }
        }
        info!(topic = %subscribe_topic, "subscribed to MQTT topic");

        Ok(BrokerSession {
            publisher: Arc::new(MqttSessionPublisher { client }),
            events: Box::new(MqttSessionEvents {
                eventloop,
                buffered,
            }),
        })
    }
}

struct MqttSessionPublisher {
    client: AsyncClient,
}

#[async_trait]
impl SessionPublisher for MqttSessionPublisher {
    /// Hands the request to the event loop without waiting for room. A full
    /// request channel means the loop is behind, which is reported as a
    /// rejection instead of blocking the caller.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| PublishError::BrokerRejected(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
    }
}

struct MqttSessionEvents {
    eventloop: EventLoop,
    buffered: VecDeque<InboundPayload>,
}

#[async_trait]
impl SessionEvents for MqttSessionEvents {
    async fn next(&mut self) -> Result<InboundPayload, ConnectivityError> {
        if let Some(payload) = self.buffered.pop_front() {
            return Ok(payload);
        }

        loop {
            match self.eventloop.poll().await.map_err(connectivity)? {
                Event::Incoming(Packet::Publish(publish)) => return Ok(to_inbound(publish)),
                Event::Incoming(Packet::Disconnect) => {
                    return Err(ConnectivityError(
                        "broker closed the session".to_string(),
                    ))
                }
                _ => continue,
            }
        }
    }
}
