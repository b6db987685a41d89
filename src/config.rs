//! Client configuration

use crate::error::{ClientError, Result};
use crate::net::ConnectionManagerFactory;
use crate::signing::SigningConfig;
use slingshot_core_resilience::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;

/// Default part size for ranged GETs and multipart PUTs (8 MiB)
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Minimum multipart part size accepted by S3 (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Default ceiling for automatic part-size scale-up (64 MiB)
pub const DEFAULT_MAX_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum number of parts in a multipart upload
pub const MAX_UPLOAD_PARTS: u64 = 10_000;

/// Estimated throughput a single endpoint IP sustains, used to size the
/// VIP table from the client's throughput target
pub const THROUGHPUT_PER_VIP_GBPS: f64 = 4.1;

/// Default throughput target (Gbps)
pub const DEFAULT_THROUGHPUT_TARGET_GBPS: f64 = 10.0;

/// Default connections opened against each VIP
pub const DEFAULT_CONNECTIONS_PER_VIP: u32 = 10;

/// Requests served on one connection before it is rotated out
/// (S3 limits requests per connection)
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: u32 = 100;

/// Default cap on parts in flight within a single meta-request
pub const DEFAULT_META_REQUEST_WINDOW: u32 = 16;

/// Default cap on bytes parked in body-streaming queues before dispatch pauses
pub const DEFAULT_MAX_BUFFERED_STREAM_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Extra room allowed in a response-body buffer beyond the part size
pub const RESPONSE_BODY_HEADROOM: u64 = 256 * 1024;

/// Default interval between endpoint hostname re-resolutions
pub const DEFAULT_DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Default worker threads on the body-streaming runtime
pub const DEFAULT_STREAMING_THREADS: usize = 2;

/// Callback invoked once the client has fully shut down
pub type ShutdownCallback = Box<dyn FnOnce() + Send + Sync>;

/// Client configuration
///
/// # Example
///
/// ```no_run
/// use slingshot::config::ClientConfig;
/// use slingshot::signing::{Credentials, SigningConfig, StaticCredentialsProvider};
/// use std::sync::Arc;
///
/// let provider = Arc::new(StaticCredentialsProvider::new(Credentials::new(
///     "AKIDEXAMPLE",
///     "secret",
/// )));
/// let mut config = ClientConfig::new(
///     "us-east-1",
///     "my-bucket.s3.us-east-1.amazonaws.com",
///     SigningConfig::default_for("us-east-1", provider),
/// );
/// config.throughput_target_gbps = 25.0;
/// assert!(config.validate().is_ok());
/// ```
pub struct ClientConfig {
    /// AWS region of the bucket (e.g. "us-east-1")
    pub region: String,

    /// Endpoint hostname the bucket resolves through
    pub endpoint: String,

    /// TCP port (443 for TLS)
    pub port: u16,

    /// Part size for ranged GETs and multipart PUTs
    pub part_size: u64,

    /// Upper bound for automatic part-size scale-up on large uploads
    pub max_part_size: u64,

    /// Throughput the client sizes its VIP table for
    pub throughput_target_gbps: f64,

    /// Connections opened against each VIP
    pub connections_per_vip: u32,

    /// Requests served on one connection before rotation
    pub max_requests_per_connection: u32,

    /// Cap on parts in flight within a single meta-request
    pub meta_request_window: u32,

    /// Global cap on requests in flight; defaults to twice the connection
    /// slot count when `None`
    pub max_requests_in_flight: Option<u64>,

    /// Cap on bytes parked in body-streaming queues
    pub max_buffered_stream_bytes: u64,

    /// Interval between hostname re-resolutions; `None` disables the
    /// built-in resolver (host events must then be pushed externally)
    pub dns_refresh_interval: Option<Duration>,

    /// Worker threads on the body-streaming runtime
    pub streaming_threads: usize,

    /// Retry budget and backoff schedule
    pub retry: RetryConfig,

    /// Request signing configuration
    pub signing: SigningConfig,

    /// Invoked exactly once when the client has fully shut down
    pub shutdown_callback: Option<ShutdownCallback>,

    /// Override for the per-VIP connection manager factory; defaults to
    /// the TLS/HTTP factory
    pub manager_factory: Option<Arc<dyn ConnectionManagerFactory>>,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the
    /// required fields.
    pub fn new(
        region: impl Into<String>,
        endpoint: impl Into<String>,
        signing: SigningConfig,
    ) -> Self {
        Self {
            region: region.into(),
            endpoint: endpoint.into(),
            port: 443,
            part_size: DEFAULT_PART_SIZE,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            throughput_target_gbps: DEFAULT_THROUGHPUT_TARGET_GBPS,
            connections_per_vip: DEFAULT_CONNECTIONS_PER_VIP,
            max_requests_per_connection: DEFAULT_MAX_REQUESTS_PER_CONNECTION,
            meta_request_window: DEFAULT_META_REQUEST_WINDOW,
            max_requests_in_flight: None,
            max_buffered_stream_bytes: DEFAULT_MAX_BUFFERED_STREAM_BYTES,
            dns_refresh_interval: Some(DEFAULT_DNS_REFRESH_INTERVAL),
            streaming_threads: DEFAULT_STREAMING_THREADS,
            retry: RetryConfig::default(),
            signing,
            shutdown_callback: None,
            manager_factory: None,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(ClientError::InvalidArgument(
                "region cannot be empty".to_string(),
            ));
        }

        if self.endpoint.is_empty() {
            return Err(ClientError::InvalidArgument(
                "endpoint cannot be empty".to_string(),
            ));
        }
        // The endpoint is a bare hostname; anything with a scheme or path
        // means the caller passed a URL.
        if url::Url::parse(&format!("https://{}", self.endpoint))
            .map(|u| u.host_str() != Some(self.endpoint.as_str()))
            .unwrap_or(true)
        {
            return Err(ClientError::InvalidArgument(format!(
                "endpoint must be a hostname, got: {}",
                self.endpoint
            )));
        }

        if self.part_size < MIN_PART_SIZE {
            return Err(ClientError::InvalidArgument(format!(
                "part size {} is below the S3 minimum {}",
                self.part_size, MIN_PART_SIZE
            )));
        }
        if self.max_part_size < self.part_size {
            return Err(ClientError::InvalidArgument(format!(
                "max part size {} is below part size {}",
                self.max_part_size, self.part_size
            )));
        }

        if self.throughput_target_gbps <= 0.0 || !self.throughput_target_gbps.is_finite() {
            return Err(ClientError::InvalidArgument(
                "throughput target must be a positive number of Gbps".to_string(),
            ));
        }

        if self.connections_per_vip == 0 {
            return Err(ClientError::InvalidArgument(
                "connections per VIP must be at least 1".to_string(),
            ));
        }
        if self.max_requests_per_connection == 0 {
            return Err(ClientError::InvalidArgument(
                "max requests per connection must be at least 1".to_string(),
            ));
        }
        if self.meta_request_window == 0 {
            return Err(ClientError::InvalidArgument(
                "meta-request window must be at least 1".to_string(),
            ));
        }
        if self.streaming_threads == 0 {
            return Err(ClientError::InvalidArgument(
                "streaming threads must be at least 1".to_string(),
            ));
        }
        if self.max_requests_in_flight == Some(0) {
            return Err(ClientError::InvalidArgument(
                "max requests in flight must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of VIPs the client tries to keep alive for the throughput
    /// target.
    pub fn ideal_vip_count(&self) -> u32 {
        (self.throughput_target_gbps / THROUGHPUT_PER_VIP_GBPS)
            .ceil()
            .max(1.0) as u32
    }

    /// Effective global in-flight request cap.
    pub fn effective_max_requests_in_flight(&self) -> u64 {
        self.max_requests_in_flight.unwrap_or_else(|| {
            2 * u64::from(self.ideal_vip_count()) * u64::from(self.connections_per_vip)
        })
    }

    /// Response-body buffer cap handed to connection managers.
    pub fn max_response_size(&self) -> u64 {
        self.max_part_size + RESPONSE_BODY_HEADROOM
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("part_size", &self.part_size)
            .field("max_part_size", &self.max_part_size)
            .field("throughput_target_gbps", &self.throughput_target_gbps)
            .field("connections_per_vip", &self.connections_per_vip)
            .field(
                "max_requests_per_connection",
                &self.max_requests_per_connection,
            )
            .field("meta_request_window", &self.meta_request_window)
            .field("max_requests_in_flight", &self.max_requests_in_flight)
            .field("dns_refresh_interval", &self.dns_refresh_interval)
            .field("streaming_threads", &self.streaming_threads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{Credentials, StaticCredentialsProvider};

    fn test_config() -> ClientConfig {
        let provider = Arc::new(StaticCredentialsProvider::new(Credentials::new(
            "AKIDEXAMPLE",
            "secret",
        )));
        ClientConfig::new(
            "us-east-1",
            "bucket.s3.us-east-1.amazonaws.com",
            SigningConfig::default_for("us-east-1", provider),
        )
    }

    #[test]
    fn test_defaults_validate() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_region() {
        let mut config = test_config();
        config.region = String::new();
        assert!(matches!(
            config.validate(),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_url_endpoint() {
        let mut config = test_config();
        config.endpoint = "https://bucket.s3.amazonaws.com/prefix".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_small_part_size() {
        let mut config = test_config();
        config.part_size = MIN_PART_SIZE - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_max_part_below_part() {
        let mut config = test_config();
        config.max_part_size = config.part_size - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ideal_vip_count_rounds_up() {
        let mut config = test_config();
        config.throughput_target_gbps = 10.0;
        assert_eq!(config.ideal_vip_count(), 3); // ceil(10 / 4.1)

        config.throughput_target_gbps = 4.1;
        assert_eq!(config.ideal_vip_count(), 1);

        config.throughput_target_gbps = 100.0;
        assert_eq!(config.ideal_vip_count(), 25);
    }

    #[test]
    fn test_ideal_vip_count_is_at_least_one() {
        let mut config = test_config();
        config.throughput_target_gbps = 0.5;
        assert_eq!(config.ideal_vip_count(), 1);
    }

    #[test]
    fn test_effective_in_flight_cap() {
        let mut config = test_config();
        config.throughput_target_gbps = 10.0; // 3 VIPs
        config.connections_per_vip = 10;
        assert_eq!(config.effective_max_requests_in_flight(), 60);

        config.max_requests_in_flight = Some(7);
        assert_eq!(config.effective_max_requests_in_flight(), 7);
    }
}
