//! HTTP transport seam
//!
//! The scheduler is written against three small traits rather than a
//! concrete HTTP stack: a connection executes one request at a time, a
//! per-VIP manager hands connections out and takes them back, and a factory
//! builds one manager per endpoint address. The default implementation
//! (hyper + rustls, [`TlsConnectionManagerFactory`]) lives in this module's
//! `factory` submodule; tests substitute scripted in-memory managers.

mod factory;

pub use factory::TlsConnectionManagerFactory;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;

/// A request ready to put on the wire.
///
/// `path` and `query` are kept separate because signing canonicalizes them
/// differently; both are already percent-encoded by the time they get here.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Percent-encoded path, always starting with `/`
    pub path: String,
    /// Percent-encoded query string, without the leading `?`
    pub query: Option<String>,
    /// Headers, including `Host`
    pub headers: HeaderMap,
    /// Request body (empty for GETs)
    pub body: Bytes,
}

impl HttpRequest {
    /// The request target as it appears on the request line.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body, bounded by the client's response-buffer cap
    pub body: Bytes,
}

impl HttpResponse {
    /// A header value as UTF-8, when present and valid.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The response body as UTF-8 (lossy), for XML parsing and diagnostics.
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// One HTTP connection. Requests are executed one at a time; the scheduler
/// owns the connection exclusively while a request is in flight.
#[async_trait]
pub trait HttpConnection: Send + Sync {
    /// Run one round trip, buffering the whole response body.
    async fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse>;

    /// Whether the connection can take another request. A closed connection
    /// is retired by the next dispatch that holds it.
    fn is_open(&self) -> bool;
}

/// Per-VIP connection source. Acquisition is asynchronous — it may need a
/// full TCP + TLS handshake — and must never be called from the scheduler
/// task directly, only from dispatch futures.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Get a live connection, reusing one when possible.
    async fn acquire(&self) -> Result<Box<dyn HttpConnection>>;

    /// Return a connection. `reusable: false` discards it (protocol error,
    /// rotation limit, server close).
    async fn release(&self, conn: Box<dyn HttpConnection>, reusable: bool);

    /// Drop idle connections ahead of VIP teardown.
    async fn shutdown(&self);
}

/// Builds one [`ConnectionManager`] per endpoint address.
#[async_trait]
pub trait ConnectionManagerFactory: Send + Sync {
    /// Create a manager whose connections dial `address` while presenting
    /// `host` for SNI and the `Host` header.
    async fn create_manager(&self, host: &str, address: IpAddr)
        -> Result<Arc<dyn ConnectionManager>>;
}
