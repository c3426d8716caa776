use chrono::{DateTime, Utc};
use serde::Serialize;
use transport_connector::ConnectionState;

/// Point-in-time view of the pipeline for status endpoints.
///
/// Never an error: a backlog that cannot be counted is reported as `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub connector_state: ConnectionState,
    pub pending_count: Option<u64>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub subscriber_count: usize,
    /// Inbound payloads dropped because ingest fell behind
    pub dropped_inbound: u64,
}

impl HealthReport {
    /// Connected to the broker and able to read the backlog
    pub fn is_healthy(&self) -> bool {
        self.connector_state.is_connected() && self.pending_count.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_report_serializes_connector_state_inline() {
        let report = HealthReport {
            connector_state: ConnectionState::Connected,
            pending_count: Some(3),
            last_tick_at: None,
            subscriber_count: 1,
            dropped_inbound: 0,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["connector_state"]["state"], "connected");
        assert_eq!(json["pending_count"], 3);
        assert!(json["last_tick_at"].is_null());
        assert!(report.is_healthy());
    }

    #[test]
    fn test_unknown_backlog_is_unhealthy() {
        let report = HealthReport {
            connector_state: ConnectionState::Connected,
            pending_count: None,
            last_tick_at: None,
            subscriber_count: 0,
            dropped_inbound: 0,
        };
        assert!(!report.is_healthy());
    }
}
