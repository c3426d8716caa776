use crate::domain::{TelemetryPacket, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned by persistence; strictly increasing in assignment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal result of processing a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Pending,
    Success,
    PartialFailure,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Pending => "pending",
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::PartialFailure => "partial_failure",
        }
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingOutcome::Pending),
            "success" => Ok(ProcessingOutcome::Success),
            "partial_failure" => Ok(ProcessingOutcome::PartialFailure),
            other => Err(format!("unknown processing outcome: {}", other)),
        }
    }
}

/// A persisted telemetry packet together with its processing status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub packet: TelemetryPacket,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_outcome: ProcessingOutcome,
}

impl StoredMessage {
    /// Packet JSON enriched with the persistence metadata.
    pub fn to_event_json(&self) -> serde_json::Value {
        let mut value = self.packet.to_json();
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("message_id".to_string(), self.id.value().into());
            map.insert(
                "received_at".to_string(),
                self.received_at.to_rfc3339().into(),
            );
        }
        value
    }
}

/// Default page size for message queries
pub const DEFAULT_QUERY_LIMIT: usize = 100;
/// Upper bound on a single query page
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Read-only query over stored messages, independent of processing status.
///
/// Results are ordered newest first by `received_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub limit: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            start_time: None,
            end_time: None,
            key: None,
            value: None,
        }
    }
}

/// Field predicate resolved from a query's `key`/`value` pair
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    DeviceId(String),
    Status(String),
    BatteryLevel(f64),
    Measurement { name: String, value: f64 },
}

impl FieldFilter {
    pub fn matches(&self, packet: &TelemetryPacket) -> bool {
        match self {
            FieldFilter::DeviceId(device_id) => packet.device_id() == device_id,
            FieldFilter::Status(status) => packet.status() == status,
            FieldFilter::BatteryLevel(level) => packet.battery_level() == Some(*level),
            FieldFilter::Measurement { name, value } => packet.measurement(name) == Some(*value),
        }
    }
}

impl MessageQuery {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_time_range(
        mut self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self.value = Some(value.into());
        self
    }

    /// Checks bounds and resolves the optional field filter.
    pub fn field_filter(&self) -> Result<Option<FieldFilter>, ValidationError> {
        if self.limit == 0 || self.limit > MAX_QUERY_LIMIT {
            return Err(ValidationError::InvalidQuery(format!(
                "limit must be between 1 and {}, got {}",
                MAX_QUERY_LIMIT, self.limit
            )));
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(ValidationError::InvalidQuery(
                    "start_time must not be after end_time".to_string(),
                ));
            }
        }

        match (&self.key, &self.value) {
            (None, None) => Ok(None),
            (Some(key), Some(value)) => match key.as_str() {
                "" => Err(ValidationError::InvalidQuery("key must not be empty".to_string())),
                "device_id" => Ok(Some(FieldFilter::DeviceId(value.clone()))),
                "status" => Ok(Some(FieldFilter::Status(value.clone()))),
                "battery_level" => Ok(Some(FieldFilter::BatteryLevel(numeric_value(key, value)?))),
                name => Ok(Some(FieldFilter::Measurement {
                    name: name.to_string(),
                    value: numeric_value(name, value)?,
                })),
            },
            _ => Err(ValidationError::InvalidQuery(
                "key and value must be provided together".to_string(),
            )),
        }
    }
}

fn numeric_value(key: &str, value: &str) -> Result<f64, ValidationError> {
    value.parse::<f64>().map_err(|_| {
        ValidationError::InvalidQuery(format!(
            "value for {} must be numeric, got {}",
            key, value
        ))
    })
}

/// A page of query results
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    pub items: Vec<StoredMessage>,
    /// Number of matching messages ignoring the page limit
    pub total_count: u64,
}
