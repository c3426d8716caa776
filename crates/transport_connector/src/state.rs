use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Connection state of the transport connector.
///
/// `Backoff` carries the number of consecutive failed attempts and the instant
/// the next attempt is scheduled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Backoff {
                attempt,
                next_retry_at,
            } => write!(f, "backoff(attempt={}, next_retry_at={})", attempt, next_retry_at),
        }
    }
}
