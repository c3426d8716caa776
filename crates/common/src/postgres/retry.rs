use crate::domain::StorageError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Result of a single storage attempt that did not succeed
#[derive(Debug)]
pub(crate) enum OpFailure {
    /// Worth another attempt, e.g. a dropped connection
    Transient(String),
    Permanent(StorageError),
}

/// SQLSTATE classes that indicate the server or connection, not the request
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(code, "40001" | "40P01" | "53300" | "57P01" | "57P02" | "57P03")
}

pub(crate) fn classify_db_error(e: tokio_postgres::Error) -> OpFailure {
    match e.code() {
        Some(state) if is_transient_sqlstate(state.code()) => OpFailure::Transient(e.to_string()),
        Some(_) => OpFailure::Permanent(StorageError::Rejected(e.to_string())),
        // No SQLSTATE means the failure happened below the protocol layer
        None => OpFailure::Transient(e.to_string()),
    }
}

/// Bounded, doubling retry of transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub(crate) async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt_fn: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OpFailure>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(OpFailure::Permanent(e)) => return Err(e),
                Err(OpFailure::Transient(reason)) if attempt >= self.max_attempts => {
                    return Err(StorageError::Unavailable(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, reason
                    )));
                }
                Err(OpFailure::Transient(reason)) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
