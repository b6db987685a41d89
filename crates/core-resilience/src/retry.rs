//! Retry budget: token-bucket gating plus an exponential backoff schedule
//!
//! Blind per-request retry loops amplify outages: when a service degrades,
//! every in-flight request fails and retries at once, multiplying load
//! exactly when the service can least afford it. A shared token bucket
//! bounds the *aggregate* retry rate across all concurrent operations:
//! each retry spends tokens, each success refunds a fraction, and when the
//! bucket runs dry further retries are refused until successes replenish it.
//!
//! The backoff schedule is computed here without jitter; callers that fan
//! out many concurrent retries are expected to add their own randomization
//! on top.
//!
//! # Example
//!
//! ```
//! use slingshot_core_resilience::retry::{RetryConfig, RetryStrategy};
//! use std::time::Duration;
//!
//! let strategy = RetryStrategy::new(RetryConfig {
//!     token_capacity: 10,
//!     retry_cost: 5,
//!     success_refund: 1,
//!     ..Default::default()
//! });
//!
//! assert!(strategy.try_acquire_token().is_ok()); // 10 -> 5
//! assert!(strategy.try_acquire_token().is_ok()); // 5 -> 0
//! assert!(strategy.try_acquire_token().is_err()); // dry
//!
//! strategy.record_success(); // refund
//! ```

use super::error::ResilienceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for a [`RetryStrategy`]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries for a single operation before it is failed outright
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound on any computed backoff delay
    pub max_backoff: Duration,

    /// Size of the shared token bucket
    pub token_capacity: u64,

    /// Tokens spent per granted retry
    pub retry_cost: u64,

    /// Tokens refunded per successful operation (capped at capacity)
    pub success_refund: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(20),
            token_capacity: 500,
            retry_cost: 5,
            success_refund: 1,
        }
    }
}

/// Shared retry budget with an exponential backoff schedule.
///
/// Thread-safe via atomics; one instance is shared by every operation
/// running against the same remote service.
#[derive(Debug)]
pub struct RetryStrategy {
    config: RetryConfig,
    tokens: AtomicU64,
}

impl RetryStrategy {
    /// Create a strategy with a full bucket.
    pub fn new(config: RetryConfig) -> Self {
        let tokens = AtomicU64::new(config.token_capacity);
        Self { config, tokens }
    }

    /// Request permission to retry.
    ///
    /// Spends `retry_cost` tokens on grant; returns
    /// [`ResilienceError::RetryBudgetExhausted`] when the bucket cannot
    /// cover the cost.
    pub fn try_acquire_token(&self) -> Result<(), ResilienceError> {
        let cost = self.config.retry_cost;
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < cost {
                tracing::debug!(tokens = current, cost, "retry budget exhausted");
                return Err(ResilienceError::RetryBudgetExhausted);
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - cost,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Record a successful operation, refunding part of the budget.
    pub fn record_success(&self) {
        let refund = self.config.success_refund;
        let capacity = self.config.token_capacity;
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = (current + refund).min(capacity);
            if next == current {
                return;
            }
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Backoff delay before retry attempt `attempt` (1-based), doubling from
    /// `initial_backoff` and capped at `max_backoff`. No jitter; callers add
    /// their own.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        base.min(self.config.max_backoff)
    }

    /// Whether another retry is allowed for an operation already retried
    /// `retries` times.
    pub fn retries_remaining(&self, retries: u32) -> bool {
        retries < self.config.max_retries
    }

    /// Tokens currently in the bucket.
    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// The strategy's configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
