//! Slingshot Core Resilience: pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks for driving a remote service hard without falling over
//! when it pushes back:
//!
//! - **Connection Pool**: bounded reuse of factory-created connections with
//!   health checks and lifetime limits
//! - **Retry Budget**: token-bucket gating of aggregate retry rate plus an
//!   exponential backoff schedule
//! - **Backpressure**: dual-threshold (in-flight count + buffered bytes)
//!   dispatch gating
//! - **Ref Counting**: atomic counters with on-zero hooks for resources
//!   with asynchronous teardown
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Network protocols (HTTP, TLS, DNS)
//! - Any specific remote service
//! - Application-specific concerns
//!
//! It provides generic, composable patterns usable from any layer.
//!
//! # Usage Example
//!
//! ```no_run
//! use slingshot_core_resilience::{ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};
//! use std::sync::Arc;
//!
//! # struct MyConnection;
//! struct MyConnectionFactory;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory<MyConnection> for MyConnectionFactory {
//!     async fn create(&self) -> Result<MyConnection, ResilienceError> {
//! #       Ok(MyConnection)
//!     }
//!
//!     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let factory = Arc::new(MyConnectionFactory);
//! let pool = ConnectionPool::new(factory, PoolConfig::default());
//!
//! let conn = pool.acquire().await?;
//! // Use connection...
//! pool.release(conn, true).await;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod connection_pool;
pub mod error;
pub mod ref_count;
pub mod retry;

// Re-export main types for convenience
pub use backpressure::{BackpressureConfig, BackpressureGuard, BackpressureState};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats};
pub use error::ResilienceError;
pub use ref_count::RefCount;
pub use retry::{RetryConfig, RetryStrategy};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use slingshot_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backpressure::{BackpressureConfig, BackpressureGuard};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig};
    pub use super::error::ResilienceError;
    pub use super::ref_count::RefCount;
    pub use super::retry::{RetryConfig, RetryStrategy};
}
