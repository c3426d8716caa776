//! Runtime knobs shared by every pipeline component.

use crate::domain::ConfigurationError;
use crate::validation::format_validation_report;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Receiving side of the hot-reload channel. Components read the current
/// value at the start of each unit of work and never cache it across units.
pub type ConfigWatch = watch::Receiver<Arc<PipelineConfig>>;

/// Validated configuration consumed by the pipeline.
///
/// Durations are carried as milliseconds so the struct maps one-to-one onto
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    #[garde(length(min = 1), custom(no_wildcards))]
    pub publish_topic: String,
    #[garde(length(min = 1))]
    pub subscribe_topic: String,

    #[garde(range(min = 10))]
    pub processing_interval_ms: u64,
    #[garde(range(min = 1, max = 10_000))]
    pub batch_limit: usize,
    #[garde(range(min = 1, max = 1024))]
    pub max_concurrency: usize,

    #[garde(range(min = 1, max = 256))]
    pub pool_size: usize,
    #[garde(range(min = 1))]
    pub pool_wait_timeout_ms: u64,
    #[garde(range(min = 1, max = 20))]
    pub storage_retry_attempts: u32,
    #[garde(range(min = 1))]
    pub storage_retry_base_ms: u64,
    #[garde(custom(at_least(self.storage_retry_base_ms, "storage_retry_base_ms")))]
    pub storage_retry_max_ms: u64,

    #[garde(range(min = 1))]
    pub backoff_base_ms: u64,
    #[garde(custom(at_least(self.backoff_base_ms, "backoff_base_ms")))]
    pub backoff_cap_ms: u64,
    /// Upper bound of the random jitter as a fraction of `backoff_base_ms`
    #[garde(range(min = 0.0, max = 1.0))]
    pub backoff_jitter: f64,
    #[garde(range(min = 1))]
    pub stable_connection_window_ms: u64,
    #[garde(range(min = 1))]
    pub connect_timeout_ms: u64,

    #[garde(range(min = 1, max = 65_536))]
    pub broadcaster_queue_size: usize,
    #[garde(range(min = 100))]
    pub heartbeat_interval_ms: u64,

    #[garde(range(min = 1))]
    pub script_timeout_ms: u64,
    #[garde(length(min = 1))]
    pub alert_script: Option<String>,
    #[garde(range(min = 0.0, max = 100.0))]
    pub low_battery_threshold: f64,
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub healthy_statuses: Vec<String>,

    #[garde(skip)]
    pub shutdown_grace_ms: u64,
}

fn no_wildcards(value: &str, _ctx: &()) -> garde::Result {
    if value.contains('#') || value.contains('+') {
        return Err(garde::Error::new("publish topic must not contain wildcards"));
    }
    Ok(())
}

fn at_least(floor: u64, name: &'static str) -> impl FnOnce(&u64, &()) -> garde::Result {
    move |value, _| {
        if *value < floor {
            return Err(garde::Error::new(format!(
                "must not be lower than {} ({})",
                name, floor
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publish_topic: "telemetry/processed".to_string(),
            subscribe_topic: "telemetry/raw".to_string(),
            processing_interval_ms: 5_000,
            batch_limit: 100,
            max_concurrency: 8,
            pool_size: 10,
            pool_wait_timeout_ms: 5_000,
            storage_retry_attempts: 3,
            storage_retry_base_ms: 100,
            storage_retry_max_ms: 2_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            backoff_jitter: 0.1,
            stable_connection_window_ms: 30_000,
            connect_timeout_ms: 10_000,
            broadcaster_queue_size: 256,
            heartbeat_interval_ms: 15_000,
            script_timeout_ms: 10_000,
            alert_script: None,
            low_battery_threshold: 15.0,
            healthy_statuses: vec!["ok".to_string()],
            shutdown_grace_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Run every check and hand the config back only if it passes
    pub fn validated(self) -> Result<Self, ConfigurationError> {
        self.validate()
            .map_err(|report| ConfigurationError::Invalid(format_validation_report(&report)))?;
        Ok(self)
    }

    /// Names of fields that differ from `other` but are only read at startup.
    /// The storage pool and its retry policy are built once; everything else
    /// is re-read per tick, per reconnect or per subscription.
    pub fn restart_only_changes(&self, other: &PipelineConfig) -> Vec<&'static str> {
        let startup_fields = [
            ("pool_size", self.pool_size != other.pool_size),
            ("pool_wait_timeout_ms", self.pool_wait_timeout_ms != other.pool_wait_timeout_ms),
            (
                "storage_retry_attempts",
                self.storage_retry_attempts != other.storage_retry_attempts,
            ),
            (
                "storage_retry_base_ms",
                self.storage_retry_base_ms != other.storage_retry_base_ms,
            ),
            (
                "storage_retry_max_ms",
                self.storage_retry_max_ms != other.storage_retry_max_ms,
            ),
        ];
        startup_fields
            .into_iter()
            .filter_map(|(name, changed)| changed.then_some(name))
            .collect()
    }

    /// Topic that low-battery and status alerts are published to
    pub fn alert_topic(&self) -> String {
        format!("{}/alerts", self.publish_topic)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_wait_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn stable_connection_window(&self) -> Duration {
        Duration::from_millis(self.stable_connection_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn is_healthy_status(&self, status: &str) -> bool {
        self.healthy_statuses.iter().any(|s| s == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validated().is_ok());
    }

    #[test]
    fn test_backoff_cap_below_base_is_rejected() {
        let config = PipelineConfig {
            backoff_base_ms: 5_000,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };

        match config.validated() {
            Err(ConfigurationError::Invalid(msg)) => assert!(msg.contains("backoff_cap_ms")),
            other => panic!("expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_batch_limit_is_rejected() {
        let config = PipelineConfig {
            batch_limit: 0,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_wildcard_publish_topic_is_rejected() {
        let config = PipelineConfig {
            publish_topic: "telemetry/#".to_string(),
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_jitter_out_of_range_is_rejected() {
        let config = PipelineConfig {
            backoff_jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_empty_alert_script_is_rejected() {
        let config = PipelineConfig {
            alert_script: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_storage_fields_need_restart() {
        let current = PipelineConfig::default();
        let next = PipelineConfig {
            pool_size: 20,
            pool_wait_timeout_ms: 1,
            storage_retry_attempts: 9,
            storage_retry_base_ms: 50,
            storage_retry_max_ms: 9_000,
            ..Default::default()
        };

        assert_eq!(
            current.restart_only_changes(&next),
            vec![
                "pool_size",
                "pool_wait_timeout_ms",
                "storage_retry_attempts",
                "storage_retry_base_ms",
                "storage_retry_max_ms",
            ]
        );
    }

    #[test]
    fn test_connection_fields_apply_live() {
        let current = PipelineConfig::default();
        let next = PipelineConfig {
            subscribe_topic: "telemetry/other".to_string(),
            connect_timeout_ms: 1_000,
            backoff_base_ms: 500,
            stable_connection_window_ms: 5_000,
            ..Default::default()
        };

        assert!(current.restart_only_changes(&next).is_empty());
    }

    #[test]
    fn test_processing_fields_apply_live() {
        let current = PipelineConfig::default();
        let next = PipelineConfig {
            batch_limit: 5,
            max_concurrency: 2,
            processing_interval_ms: 100,
            publish_topic: "telemetry/elsewhere".to_string(),
            broadcaster_queue_size: 8,
            shutdown_grace_ms: 1_000,
            ..Default::default()
        };

        assert!(current.restart_only_changes(&next).is_empty());
    }

    #[test]
    fn test_alert_topic() {
        let config = PipelineConfig::default();
        assert_eq!(config.alert_topic(), "telemetry/processed/alerts");
    }
}
