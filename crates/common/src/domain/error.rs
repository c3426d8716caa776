use std::time::Duration;
use thiserror::Error;

/// A payload or query that does not satisfy the telemetry schema.
///
/// Never retried and never persisted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Payload is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("Payload does not match the telemetry schema: {0}")]
    SchemaViolation(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Transient failures that survived every retry
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage rejected the operation: {0}")]
    Rejected(String),

    #[error("Connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),
}

/// Broker could not be reached or the session was lost
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Broker connectivity error: {0}")]
pub struct ConnectivityError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Broker rejected publish: {0}")]
    BrokerRejected(String),
}

/// Failure of a single action; isolated from every other action in the tick
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionExecutionError {
    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Failed to encode action payload: {0}")]
    Encode(String),

    #[error("Script {command} failed to start: {reason}")]
    ScriptSpawn { command: String, reason: String },

    #[error("Script {command} exited with status {status}")]
    ScriptFailed { command: String, status: String },

    #[error("Script {command} timed out after {timeout:?}")]
    ScriptTimeout { command: String, timeout: Duration },

    #[error("Action panicked")]
    Panicked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Coarse classification used by request/response surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 4xx-equivalent
    ClientError,
    /// 5xx-equivalent
    ServerError,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubmitError {
    pub fn status_class(&self) -> StatusClass {
        match self {
            SubmitError::Validation(_) => StatusClass::ClientError,
            SubmitError::Storage(_) => StatusClass::ServerError,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueryError {
    pub fn status_class(&self) -> StatusClass {
        match self {
            QueryError::Validation(_) => StatusClass::ClientError,
            QueryError::Storage(_) => StatusClass::ServerError,
        }
    }
}
