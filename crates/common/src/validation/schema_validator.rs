//! Schema Validator: raw bytes in, [`TelemetryPacket`] out.

use crate::domain::{ConfigurationError, TelemetryPacket, ValidationError};
use chrono::{DateTime, SubsecRound, Utc};
use jsonschema::Validator;
use serde::Deserialize;
use std::collections::BTreeMap;

const TELEMETRY_PACKET_SCHEMA: &str = r#"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "type": "object",
    "required": ["device_id", "timestamp", "measurements", "status"],
    "properties": {
        "device_id": { "type": "string", "minLength": 1, "maxLength": 128, "pattern": "\\S" },
        "timestamp": { "type": ["string", "number"], "minimum": 0 },
        "measurements": {
            "type": "object",
            "propertyNames": { "minLength": 1 },
            "additionalProperties": { "type": "number" }
        },
        "status": { "type": "string", "minLength": 1, "maxLength": 32 },
        "battery_level": { "type": ["number", "null"], "minimum": 0, "maximum": 100 }
    }
}"#;

#[derive(Deserialize)]
struct RawPacket {
    device_id: String,
    timestamp: RawTimestamp,
    measurements: BTreeMap<String, f64>,
    status: String,
    #[serde(default)]
    battery_level: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Rfc3339(String),
    UnixSeconds(f64),
}

impl RawTimestamp {
    fn resolve(self) -> Result<DateTime<Utc>, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidField {
            field: "timestamp".to_string(),
            reason,
        };

        let instant = match self {
            RawTimestamp::Rfc3339(text) => DateTime::parse_from_rfc3339(&text)
                .map_err(|e| invalid(format!("not an RFC 3339 instant: {}", e)))?
                .with_timezone(&Utc),
            RawTimestamp::UnixSeconds(seconds) => {
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(invalid(format!("{} is not a valid unix time", seconds)));
                }
                let whole = seconds.trunc() as i64;
                let nanos = ((seconds - seconds.trunc()) * 1e9).round() as u32;
                DateTime::from_timestamp(whole, nanos.min(999_999_999))
                    .ok_or_else(|| invalid(format!("{} is out of range", seconds)))?
            }
        };

        // Storage keeps microsecond precision
        Ok(instant.trunc_subsecs(6))
    }
}

/// Validates raw payloads against the telemetry packet shape.
///
/// The schema is compiled once; validation itself is a pure function of the
/// input bytes.
pub struct SchemaValidator {
    schema: Validator,
}

impl SchemaValidator {
    pub fn new() -> Result<Self, ConfigurationError> {
        let schema_value: serde_json::Value = serde_json::from_str(TELEMETRY_PACKET_SCHEMA)
            .map_err(|e| ConfigurationError::Invalid(format!("Invalid schema JSON: {}", e)))?;
        let schema = Validator::new(&schema_value)
            .map_err(|e| ConfigurationError::Invalid(format!("Invalid JSON Schema: {}", e)))?;
        Ok(Self { schema })
    }

    pub fn validate(&self, raw: &[u8]) -> Result<TelemetryPacket, ValidationError> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
        self.validate_value(value)
    }

    pub fn validate_value(&self, value: serde_json::Value) -> Result<TelemetryPacket, ValidationError> {
        let errors: Vec<String> = self
            .schema
            .iter_errors(&value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if !errors.is_empty() {
            return Err(ValidationError::SchemaViolation(errors.join("; ")));
        }

        let raw: RawPacket = serde_json::from_value(value)
            .map_err(|e| ValidationError::SchemaViolation(e.to_string()))?;

        if let Some((name, _)) = raw.measurements.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ValidationError::InvalidField {
                field: format!("measurements.{}", name),
                reason: "value must be a finite number".to_string(),
            });
        }

        let timestamp = raw.timestamp.resolve()?;

        Ok(TelemetryPacket::from_validated_parts(
            raw.device_id,
            timestamp,
            raw.measurements,
            raw.status,
            raw.battery_level,
        ))
    }
}
