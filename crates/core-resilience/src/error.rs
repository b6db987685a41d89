//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the fault-tolerance primitives
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// Timed out waiting on a primitive (e.g. pool acquire)
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connection pool has no capacity left
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Factory failed to produce a usable connection
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),

    /// Retry token budget is empty
    #[error("retry budget exhausted")]
    RetryBudgetExhausted,
}

impl ResilienceError {
    /// Whether waiting and trying again could plausibly succeed.
    ///
    /// Budget exhaustion is terminal for the current operation; timeouts and
    /// setup failures are conditions that tend to clear on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::Timeout(_) => true,
            ResilienceError::PoolExhausted => true,
            ResilienceError::ConnectionSetup(_) => true,
            ResilienceError::RetryBudgetExhausted => false,
        }
    }
}
