//! Generic connection pool with health checks and lifetime limits
//!
//! Opening a connection to a remote service costs a TCP handshake and
//! usually a TLS handshake on top; reusing live connections is the single
//! biggest latency win for request-heavy workloads. The pool hands out
//! connections created by a caller-supplied factory, keeps returned ones on
//! an idle list, and discards anything expired or unhealthy instead of
//! handing it back out.
//!
//! The pool knows nothing about what a "connection" is — the element type is
//! generic and the factory decides how to create, validate, and close one.

use super::error::ResilienceError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// Limits and lifetimes for a [`ConnectionPool`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections (idle + in use)
    pub max_size: usize,

    /// Idle connections older than this are discarded on the next acquire
    pub idle_timeout: Option<Duration>,

    /// Connections are discarded once this old regardless of activity
    pub max_lifetime: Option<Duration>,

    /// How long an acquire may wait for a free slot
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Some(Duration::from_secs(60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Creates, validates, and closes pool elements.
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Open a fresh connection.
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Whether an idle connection is still usable.
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Tear a connection down. Default: drop it.
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

struct IdleEntry<T> {
    conn: T,
    created_at: Instant,
    parked_at: Instant,
}

impl<T> IdleEntry<T> {
    fn expired(&self, config: &PoolConfig) -> bool {
        if let Some(idle_timeout) = config.idle_timeout {
            if self.parked_at.elapsed() > idle_timeout {
                return true;
            }
        }
        if let Some(max_lifetime) = config.max_lifetime {
            if self.created_at.elapsed() > max_lifetime {
                return true;
            }
        }
        false
    }
}

struct PoolState<T> {
    idle: VecDeque<IdleEntry<T>>,
    /// Birth time of every checked-out connection, keyed implicitly by the
    /// caller returning it in `release`. Only the count matters here.
    checked_out: usize,
}

/// Point-in-time pool counters
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Idle connections parked in the pool
    pub idle: usize,
    /// Connections currently checked out
    pub checked_out: usize,
    /// Configured maximum
    pub max_size: usize,
}

/// A bounded async pool of factory-created connections.
///
/// `acquire` prefers the most recently parked idle connection (LIFO keeps
/// the working set warm), skipping anything expired or failing the factory's
/// health check. When nothing idle survives, a fresh connection is created,
/// still under the size cap enforced by the semaphore.
pub struct ConnectionPool<T> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    slots: Semaphore,
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a pool around a factory.
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let slots = Semaphore::new(config.max_size);
        Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: 0,
            }),
            slots,
        }
    }

    /// Check a connection out, reusing an idle one when possible.
    ///
    /// Waits up to `acquire_timeout` for a free slot when the pool is at
    /// capacity.
    pub async fn acquire(&self) -> Result<T, ResilienceError> {
        let permit = tokio::time::timeout(self.config.acquire_timeout, self.slots.acquire())
            .await
            .map_err(|_| ResilienceError::Timeout(self.config.acquire_timeout))?
            .map_err(|_| ResilienceError::PoolExhausted)?;
        // The slot is tracked by checked_out / release, not by permit scope.
        permit.forget();

        loop {
            let candidate = {
                let mut state = self.state.lock().await;
                match state.idle.pop_back() {
                    Some(entry) => Some(entry),
                    None => {
                        state.checked_out += 1;
                        None
                    }
                }
            };

            let Some(entry) = candidate else { break };

            if entry.expired(&self.config) {
                self.factory.close(entry.conn).await;
                continue;
            }
            if !self.factory.is_healthy(&entry.conn).await {
                tracing::debug!("discarding unhealthy idle connection");
                self.factory.close(entry.conn).await;
                continue;
            }

            let mut state = self.state.lock().await;
            state.checked_out += 1;
            return Ok(entry.conn);
        }

        match self.factory.create().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut state = self.state.lock().await;
                state.checked_out -= 1;
                drop(state);
                self.slots.add_permits(1);
                Err(e)
            }
        }
    }

    /// Return a connection. Set `reusable: false` to discard it instead of
    /// parking it (e.g. after a protocol error or a service rotation limit).
    pub async fn release(&self, conn: T, reusable: bool) {
        let keep = reusable && self.factory.is_healthy(&conn).await;

        let mut state = self.state.lock().await;
        state.checked_out -= 1;
        if keep {
            let now = Instant::now();
            state.idle.push_back(IdleEntry {
                conn,
                // Creation time is unknown for returned connections; the
                // idle clock restarts, max_lifetime re-arms from here.
                created_at: now,
                parked_at: now,
            });
            drop(state);
        } else {
            drop(state);
            self.factory.close(conn).await;
        }
        self.slots.add_permits(1);
    }

    /// Close every idle connection.
    pub async fn clear_idle(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.idle)
        };
        for entry in drained {
            self.factory.close(entry.conn).await;
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            max_size: self.config.max_size,
        }
    }
}
