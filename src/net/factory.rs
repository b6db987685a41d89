//! Default connection stack: TCP → TLS (rustls) → HTTP/1.1 (hyper)
//!
//! One manager per VIP. Connections dial the VIP's address directly and
//! present the endpoint hostname for SNI and certificate validation, which
//! is what lets the client spread load across resolved addresses without
//! per-address DNS tricks. Pooling and health checks come from the generic
//! resilience pool; this module only teaches it what a connection is.

use super::{ConnectionManager, ConnectionManagerFactory, HttpConnection, HttpRequest, HttpResponse};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use slingshot_core_resilience::{ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Factory producing one pooled TLS/HTTP manager per VIP address
pub struct TlsConnectionManagerFactory {
    tls: Arc<TlsClientConfig>,
    port: u16,
    pool_size: usize,
    max_response_size: usize,
}

impl TlsConnectionManagerFactory {
    /// Build a factory using the platform trust store.
    pub fn new(port: u16, pool_size: usize, max_response_size: u64) -> Result<Self> {
        let loaded = rustls_native_certs::load_native_certs();
        let mut roots = RootCertStore::empty();
        let (added, _ignored) = roots.add_parsable_certificates(loaded.certs);
        if added == 0 {
            return Err(ClientError::Connection(
                "no usable root certificates in the platform trust store".to_string(),
            ));
        }

        let tls = TlsClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: Arc::new(tls),
            port,
            pool_size,
            max_response_size: max_response_size as usize,
        })
    }
}

#[async_trait]
impl ConnectionManagerFactory for TlsConnectionManagerFactory {
    async fn create_manager(
        &self,
        host: &str,
        address: IpAddr,
    ) -> Result<Arc<dyn ConnectionManager>> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            ClientError::InvalidArgument(format!("endpoint {host} is not a valid SNI name: {e}"))
        })?;

        let factory = Arc::new(HyperConnectionFactory {
            server_name,
            address,
            port: self.port,
            tls: Arc::clone(&self.tls),
            max_response_size: self.max_response_size,
        });
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max_size: self.pool_size,
                ..Default::default()
            },
        );
        Ok(Arc::new(PooledConnectionManager { pool }))
    }
}

struct PooledConnectionManager {
    pool: ConnectionPool<Box<dyn HttpConnection>>,
}

#[async_trait]
impl ConnectionManager for PooledConnectionManager {
    async fn acquire(&self) -> Result<Box<dyn HttpConnection>> {
        self.pool.acquire().await.map_err(pool_error)
    }

    async fn release(&self, conn: Box<dyn HttpConnection>, reusable: bool) {
        self.pool.release(conn, reusable).await;
    }

    async fn shutdown(&self) {
        self.pool.clear_idle().await;
    }
}

fn pool_error(e: ResilienceError) -> ClientError {
    match e {
        ResilienceError::ConnectionSetup(message) => ClientError::Connection(message),
        ResilienceError::Timeout(after) => {
            ClientError::Connection(format!("connection acquire timed out after {after:?}"))
        }
        ResilienceError::PoolExhausted => {
            ClientError::Connection("connection pool exhausted".to_string())
        }
        other => ClientError::Internal(other.to_string()),
    }
}

struct HyperConnectionFactory {
    server_name: ServerName<'static>,
    address: IpAddr,
    port: u16,
    tls: Arc<TlsClientConfig>,
    max_response_size: usize,
}

#[async_trait]
impl ConnectionFactory<Box<dyn HttpConnection>> for HyperConnectionFactory {
    async fn create(&self) -> std::result::Result<Box<dyn HttpConnection>, ResilienceError> {
        let stream = TcpStream::connect((self.address, self.port))
            .await
            .map_err(|e| {
                ResilienceError::ConnectionSetup(format!(
                    "tcp connect {}:{}: {e}",
                    self.address, self.port
                ))
            })?;
        // Small frames (part headers) should not sit behind Nagle.
        stream.set_nodelay(true).ok();

        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let tls_stream = connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| {
                ResilienceError::ConnectionSetup(format!("tls handshake with {}: {e}", self.address))
            })?;

        let (sender, connection) = http1::handshake(TokioIo::new(tls_stream))
            .await
            .map_err(|e| ResilienceError::ConnectionSetup(format!("http handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "http connection task ended");
            }
        });

        Ok(Box::new(HyperConnection {
            sender,
            max_response_size: self.max_response_size,
        }))
    }

    async fn is_healthy(&self, conn: &Box<dyn HttpConnection>) -> bool {
        conn.is_open()
    }
}

struct HyperConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    max_response_size: usize,
}

#[async_trait]
impl HttpConnection for HyperConnection {
    async fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let target = request.path_and_query();
        let HttpRequest {
            method,
            headers,
            body,
            ..
        } = request;

        let mut wire_request = http::Request::builder()
            .method(method)
            .uri(target)
            .body(Full::new(body))
            .map_err(|e| ClientError::Internal(format!("assemble request: {e}")))?;
        *wire_request.headers_mut() = headers;

        self.sender
            .ready()
            .await
            .map_err(|e| ClientError::Connection(format!("connection not ready: {e}")))?;
        let response = self
            .sender
            .send_request(wire_request)
            .await
            .map_err(|e| ClientError::Connection(format!("send request: {e}")))?;

        let (parts, mut incoming) = response.into_parts();
        let mut buffer = BytesMut::new();
        while let Some(frame) = incoming.frame().await {
            let frame =
                frame.map_err(|e| ClientError::Connection(format!("read response body: {e}")))?;
            if let Some(data) = frame.data_ref() {
                if buffer.len() + data.len() > self.max_response_size {
                    return Err(ClientError::Internal(format!(
                        "response body exceeds buffer cap of {} bytes",
                        self.max_response_size
                    )));
                }
                buffer.extend_from_slice(data);
            }
        }

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body: buffer.freeze(),
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
