//! Error types for the transfer client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// S3 error codes that indicate a transient condition worth retrying even
/// when the HTTP status alone would not (e.g. a 403 from request clock skew).
const RETRIABLE_ERROR_CODES: &[&str] = &[
    "SlowDown",
    "InternalError",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
];

/// Errors that can occur while running a meta-request
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Rejected at submission time
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Request signing failed
    #[error("request signing failed: {0}")]
    Signing(String),

    /// Connection acquisition or send failed
    #[error("connection failed: {0}")]
    Connection(String),

    /// Service responded with a non-success HTTP status
    #[error("http status {status}{}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    HttpStatus {
        /// HTTP response status
        status: u16,
        /// S3 error code from the response body, when one was parseable
        code: Option<String>,
    },

    /// An XML response body could not be parsed
    #[error("xml parse error: {0}")]
    XmlParse(String),

    /// The retry budget refused another attempt
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Attempts made before the budget ran out
        attempts: u32,
    },

    /// The meta-request was cancelled by the user
    #[error("meta request cancelled")]
    Cancelled,

    /// Invariant violation inside the client
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether the retry controller should consult the retry budget for
    /// this error. Non-retriable errors become the meta-request's sticky
    /// error immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::HttpStatus { status, code } => {
                Self::status_retriable(*status, code.as_deref())
            }
            ClientError::InvalidArgument(_) => false,
            ClientError::Signing(_) => false,
            ClientError::XmlParse(_) => false,
            ClientError::RetryBudgetExhausted { .. } => false,
            ClientError::Cancelled => false,
            ClientError::Internal(_) => false,
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn response_status(&self) -> Option<u16> {
        match self {
            ClientError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn status_retriable(status: u16, code: Option<&str>) -> bool {
        if matches!(status, 408 | 429 | 500 | 502 | 503 | 504) {
            return true;
        }
        if let Some(code) = code {
            return RETRIABLE_ERROR_CODES.contains(&code);
        }
        false
    }
}
