//! Backpressure: dual-threshold flow control for request dispatch
//!
//! Two independent thresholds bound how much work may be outstanding at
//! once:
//! - **Requests in flight**: HTTP round-trips dispatched but not completed
//! - **Buffered bytes**: response bodies held for in-order delivery
//!
//! When either threshold is reached, the dispatcher stops issuing new work.
//! This is cooperative — the producer checks `try_begin_request()` before
//! dispatching, and completions/deliveries release what they held.
//!
//! # Example
//!
//! ```
//! use slingshot_core_resilience::backpressure::{BackpressureConfig, BackpressureGuard};
//!
//! let guard = BackpressureGuard::new(BackpressureConfig {
//!     max_requests_in_flight: 2,
//!     max_buffered_bytes: 1024,
//! });
//!
//! assert!(guard.try_begin_request());
//! assert!(guard.try_begin_request());
//! assert!(!guard.try_begin_request()); // cap reached
//!
//! guard.end_request();
//! assert!(guard.try_begin_request());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Thresholds for a [`BackpressureGuard`]
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Maximum number of requests dispatched but not yet completed
    pub max_requests_in_flight: u64,

    /// Maximum total bytes of response bodies buffered for delivery
    pub max_buffered_bytes: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_requests_in_flight: 256,
            max_buffered_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
        }
    }
}

/// Point-in-time view of a guard's load
#[derive(Debug, Clone)]
pub struct BackpressureState {
    /// Requests currently in flight
    pub requests_in_flight: u64,

    /// Bytes currently buffered for delivery
    pub buffered_bytes: u64,

    /// Whether either threshold is currently reached
    pub saturated: bool,
}

/// Tracks outstanding work and refuses new dispatches past the thresholds.
///
/// Thread-safe via atomics; no locking. `try_begin_request` reserves a slot
/// with a compare-exchange loop so concurrent dispatchers cannot overshoot
/// the in-flight cap. The byte threshold is advisory: bytes are recorded
/// after the response arrives, so a single response may overshoot, but no
/// *new* request is begun while over the line.
#[derive(Debug)]
pub struct BackpressureGuard {
    config: BackpressureConfig,
    requests_in_flight: AtomicU64,
    buffered_bytes: AtomicU64,
}

impl BackpressureGuard {
    /// Create a guard with the given thresholds.
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            requests_in_flight: AtomicU64::new(0),
            buffered_bytes: AtomicU64::new(0),
        }
    }

    /// Reserve an in-flight slot. Returns false when either threshold is
    /// reached; the caller must not dispatch and must not call
    /// [`end_request`](Self::end_request) for a refused reservation.
    pub fn try_begin_request(&self) -> bool {
        if self.buffered_bytes.load(Ordering::Acquire) >= self.config.max_buffered_bytes {
            return false;
        }

        let mut current = self.requests_in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_requests_in_flight {
                return false;
            }
            match self.requests_in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release an in-flight slot after the request completed (success or
    /// failure).
    pub fn end_request(&self) {
        let prev = self.requests_in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "end_request without matching begin");
    }

    /// Record bytes buffered for in-order delivery.
    pub fn add_buffered(&self, bytes: u64) {
        self.buffered_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Release previously recorded buffered bytes once delivered or dropped.
    pub fn remove_buffered(&self, bytes: u64) {
        let prev = self.buffered_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "remove_buffered below zero");
    }

    /// Current requests in flight.
    pub fn requests_in_flight(&self) -> u64 {
        self.requests_in_flight.load(Ordering::Acquire)
    }

    /// Snapshot the current load.
    pub fn state(&self) -> BackpressureState {
        let requests_in_flight = self.requests_in_flight.load(Ordering::Acquire);
        let buffered_bytes = self.buffered_bytes.load(Ordering::Acquire);
        BackpressureState {
            requests_in_flight,
            buffered_bytes,
            saturated: requests_in_flight >= self.config.max_requests_in_flight
                || buffered_bytes >= self.config.max_buffered_bytes,
        }
    }
}
