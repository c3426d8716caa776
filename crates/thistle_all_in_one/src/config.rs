use common::postgres::{PostgresConfig, RetryPolicy};
use common::telemetry::{LogFormat, TelemetryConfig};
use common::{ConfigurationError, PipelineConfig};
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use transport_connector::MqttConfig;

/// Where telemetry messages are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Storage backend (postgres, memory)
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    // MQTT configuration
    /// Broker address, `mqtt://host:port`
    #[serde(default = "default_mqtt_broker_url")]
    pub mqtt_broker_url: String,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    #[serde(default)]
    pub mqtt_username: Option<String>,

    #[serde(default)]
    pub mqtt_password: Option<String>,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    // Pipeline configuration
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,

    #[serde(default = "default_publish_topic")]
    pub publish_topic: String,

    #[serde(default = "default_processing_interval_ms")]
    pub processing_interval_ms: u64,

    /// Max messages fetched per tick
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Max actions executing at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Storage connection pool size (restart to change)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_pool_wait_timeout_ms")]
    pub pool_wait_timeout_ms: u64,

    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: u32,

    #[serde(default = "default_storage_retry_base_ms")]
    pub storage_retry_base_ms: u64,

    #[serde(default = "default_storage_retry_max_ms")]
    pub storage_retry_max_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Jitter as a fraction of the base delay
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    #[serde(default = "default_stable_connection_window_ms")]
    pub stable_connection_window_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_broadcaster_queue_size")]
    pub broadcaster_queue_size: usize,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,

    /// Command run for low-battery and status alerts
    #[serde(default)]
    pub alert_script: Option<String>,

    #[serde(default = "default_low_battery_threshold")]
    pub low_battery_threshold: f64,

    /// Statuses that do not raise an alert (comma-separated)
    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: String,

    /// Time the in-flight tick gets to finish on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_closer_timeout_secs")]
    pub closer_timeout_secs: u64,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_storage_backend() -> String {
    "postgres".to_string()
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "thistle".to_string()
}

fn default_postgres_username() -> String {
    "thistle".to_string()
}

fn default_postgres_password() -> String {
    "thistle".to_string()
}

// MQTT defaults
fn default_mqtt_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "thistle-pipeline".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    30
}

// Pipeline defaults
fn default_subscribe_topic() -> String {
    "telemetry/raw".to_string()
}

fn default_publish_topic() -> String {
    "telemetry/processed".to_string()
}

fn default_processing_interval_ms() -> u64 {
    5000
}

fn default_batch_limit() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    8
}

fn default_pool_size() -> usize {
    10
}

fn default_pool_wait_timeout_ms() -> u64 {
    5000
}

fn default_storage_retry_attempts() -> u32 {
    3
}

fn default_storage_retry_base_ms() -> u64 {
    100
}

fn default_storage_retry_max_ms() -> u64 {
    2000
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_stable_connection_window_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_broadcaster_queue_size() -> usize {
    256
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_script_timeout_ms() -> u64 {
    10_000
}

fn default_low_battery_threshold() -> f64 {
    15.0
}

fn default_healthy_statuses() -> String {
    "ok".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_closer_timeout_secs() -> u64 {
    15
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "thistle".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("THISTLE"))
            .build()?
            .try_deserialize()
    }

    pub fn storage_backend(&self) -> Result<StorageBackend, ConfigurationError> {
        match self.storage_backend.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(ConfigurationError::Invalid(format!(
                "storage_backend: unknown backend {}",
                other
            ))),
        }
    }

    /// Runtime knobs; validated by the pipeline, not here
    pub fn pipeline_config(&self) -> PipelineConfig {
        let healthy_statuses = self
            .healthy_statuses
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        PipelineConfig {
            publish_topic: self.publish_topic.clone(),
            subscribe_topic: self.subscribe_topic.clone(),
            processing_interval_ms: self.processing_interval_ms,
            batch_limit: self.batch_limit,
            max_concurrency: self.max_concurrency,
            pool_size: self.pool_size,
            pool_wait_timeout_ms: self.pool_wait_timeout_ms,
            storage_retry_attempts: self.storage_retry_attempts,
            storage_retry_base_ms: self.storage_retry_base_ms,
            storage_retry_max_ms: self.storage_retry_max_ms,
            backoff_base_ms: self.backoff_base_ms,
            backoff_cap_ms: self.backoff_cap_ms,
            backoff_jitter: self.backoff_jitter,
            stable_connection_window_ms: self.stable_connection_window_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            broadcaster_queue_size: self.broadcaster_queue_size,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            script_timeout_ms: self.script_timeout_ms,
            alert_script: self.alert_script.clone().filter(|s| !s.trim().is_empty()),
            low_battery_threshold: self.low_battery_threshold,
            healthy_statuses,
            shutdown_grace_ms: self.shutdown_grace_ms,
        }
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.storage_retry_attempts,
            Duration::from_millis(self.storage_retry_base_ms),
            Duration::from_millis(self.storage_retry_max_ms),
        )
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            broker_url: self.mqtt_broker_url.clone(),
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
        }
    }

    pub fn telemetry_config(&self) -> Result<TelemetryConfig, ConfigurationError> {
        let log_format = self
            .log_format
            .parse::<LogFormat>()
            .map_err(|e| ConfigurationError::Invalid(format!("log_format: {}", e)))?;

        Ok(TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
            log_format,
        })
    }

    pub fn closer_timeout(&self) -> Duration {
        Duration::from_secs(self.closer_timeout_secs)
    }
}
