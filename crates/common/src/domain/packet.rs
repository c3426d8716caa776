use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// A single telemetry reading reported by a sensor device.
///
/// There is no public constructor: packets are produced by
/// [`crate::validation::SchemaValidator`] or rebuilt by a repository from rows
/// that were validated on the way in. Once built a packet is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPacket {
    device_id: String,
    timestamp: DateTime<Utc>,
    measurements: BTreeMap<String, f64>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery_level: Option<f64>,
}

impl TelemetryPacket {
    pub(crate) fn from_validated_parts(
        device_id: String,
        timestamp: DateTime<Utc>,
        measurements: BTreeMap<String, f64>,
        status: String,
        battery_level: Option<f64>,
    ) -> Self {
        Self {
            device_id,
            timestamp,
            measurements,
            status,
            battery_level,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Source-supplied instant of the reading.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn measurements(&self) -> &BTreeMap<String, f64> {
        &self.measurements
    }

    pub fn measurement(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).copied()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn battery_level(&self) -> Option<f64> {
        self.battery_level
    }

    /// JSON object form used for broadcasts and republishing.
    pub fn to_json(&self) -> serde_json::Value {
        let mut measurements = serde_json::Map::new();
        for (name, value) in &self.measurements {
            measurements.insert(name.clone(), serde_json::json!(value));
        }

        let mut object = serde_json::Map::new();
        object.insert("device_id".to_string(), self.device_id.clone().into());
        object.insert(
            "timestamp".to_string(),
            self.timestamp.to_rfc3339().into(),
        );
        object.insert(
            "measurements".to_string(),
            serde_json::Value::Object(measurements),
        );
        object.insert("status".to_string(), self.status.clone().into());
        if let Some(level) = self.battery_level {
            object.insert("battery_level".to_string(), serde_json::json!(level));
        }
        serde_json::Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_to_json_omits_missing_battery_level() {
        let packet = TelemetryPacket::from_validated_parts(
            "esp32-1".to_string(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            BTreeMap::from([("temperature".to_string(), 72.3)]),
            "ok".to_string(),
            None,
        );

        let json = packet.to_json();
        assert_eq!(json["device_id"], "esp32-1");
        assert_eq!(json["measurements"]["temperature"], 72.3);
        assert!(json.get("battery_level").is_none());
    }
}
