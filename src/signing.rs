//! AWS SigV4 request signing
//!
//! Every request the client sends is individually signed: the scheduler may
//! retry a request minutes after it was first built, so signatures are
//! computed at dispatch time, never at submission time.
//!
//! Bodies are declared as `UNSIGNED-PAYLOAD` by default — hashing a part
//! body on every dispatch would burn CPU the transfer needs for TLS — but a
//! config with an empty `signed_body_value` falls back to hashing the actual
//! payload, which is what plain (non-S3) SigV4 test vectors exercise.
//!
//! Paths and query strings are expected to be RFC 3986 percent-encoded
//! before they reach the signer; the canonical form is built from the
//! encoded text as-is.

use crate::error::{ClientError, Result};
use crate::net::HttpRequest;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{HeaderValue, AUTHORIZATION, HOST};
use sha2::{Digest, Sha256};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Body value declaring an unsigned payload (the S3 default here)
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// The service name signed for
pub const SERVICE_NAME: &str = "s3";

/// A set of AWS credentials
#[derive(Clone)]
pub struct Credentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token for temporary credentials
    pub session_token: Option<String>,
}

impl Credentials {
    /// Create credentials from an access key pair.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attach a session token.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Source of credentials for signing. Implementations may refresh from
/// instance metadata, a profile file, etc.; the client calls this per
/// request so rotated credentials take effect without a restart.
pub trait CredentialsProvider: Send + Sync {
    /// Current credentials.
    fn credentials(&self) -> Result<Credentials>;
}

/// Provider returning a fixed set of credentials
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    /// Wrap fixed credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// User-supplied signing configuration
#[derive(Clone)]
pub struct SigningConfig {
    /// Signing region
    pub region: String,
    /// Signing service name
    pub service: String,
    /// Credentials source
    pub credentials: Arc<dyn CredentialsProvider>,
    /// Value for the signed-body declaration; empty means "hash the payload"
    pub signed_body_value: String,
    /// Whether to emit the `x-amz-content-sha256` header
    pub signed_body_header: bool,
}

impl SigningConfig {
    /// The default S3 signing configuration: SigV4, service `s3`,
    /// unsigned payload declared in `x-amz-content-sha256`.
    pub fn default_for(region: impl Into<String>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            region: region.into(),
            service: SERVICE_NAME.to_string(),
            credentials,
            signed_body_value: UNSIGNED_PAYLOAD.to_string(),
            signed_body_header: true,
        }
    }
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("region", &self.region)
            .field("service", &self.service)
            .field("signed_body_value", &self.signed_body_value)
            .field("signed_body_header", &self.signed_body_header)
            .finish_non_exhaustive()
    }
}

/// Owned snapshot of a [`SigningConfig`], taken once at client creation so
/// per-request signing never re-reads user-owned strings.
pub struct CachedSigningConfig {
    region: String,
    service: String,
    /// `None` when the source value was empty: the payload hash is computed
    /// from the body instead.
    signed_body_value: Option<String>,
    signed_body_header: bool,
    credentials: Arc<dyn CredentialsProvider>,
}

impl CachedSigningConfig {
    /// Snapshot a signing config.
    pub fn new(config: &SigningConfig) -> Self {
        let signed_body_value = if config.signed_body_value.is_empty() {
            None
        } else {
            Some(config.signed_body_value.clone())
        };
        Self {
            region: config.region.clone(),
            service: config.service.clone(),
            signed_body_value,
            signed_body_header: config.signed_body_header,
            credentials: Arc::clone(&config.credentials),
        }
    }

    /// Signing region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Signing service.
    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Sign a request in place: adds `x-amz-date`, the security token and
/// signed-body headers where applicable, and the `Authorization` header.
///
/// The request must already carry its `Host` header — the host is part of
/// the signature.
pub fn sign_request(
    request: &mut HttpRequest,
    config: &CachedSigningConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    let credentials = config.credentials.credentials()?;

    if !request.headers.contains_key(HOST) {
        return Err(ClientError::Signing(
            "request is missing a Host header".to_string(),
        ));
    }

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    request
        .headers
        .insert("x-amz-date", header_value(&amz_date)?);
    if let Some(token) = &credentials.session_token {
        request
            .headers
            .insert("x-amz-security-token", header_value(token)?);
    }

    let payload_hash = match &config.signed_body_value {
        Some(value) => value.clone(),
        None => sha256_hex(&request.body),
    };
    if config.signed_body_header {
        request
            .headers
            .insert("x-amz-content-sha256", header_value(&payload_hash)?);
    }

    // Canonical headers: host plus every x-amz-* header, sorted by name.
    let mut signed_headers: Vec<(String, String)> = Vec::new();
    for (name, value) in request.headers.iter() {
        let name = name.as_str();
        if name == "host" || name.starts_with("x-amz-") {
            let value = value
                .to_str()
                .map_err(|_| ClientError::Signing(format!("non-ascii value in header {name}")))?;
            signed_headers.push((name.to_string(), value.trim().to_string()));
        }
    }
    signed_headers.sort();

    let signed_header_names = signed_headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = signed_headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method.as_str(),
        request.path,
        canonical_query_string(request.query.as_deref()),
        canonical_headers,
        signed_header_names,
        payload_hash
    );

    let scope = format!("{date}/{}/{}/aws4_request", config.region, config.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &credentials.secret_access_key,
        &date,
        &config.region,
        &config.service,
    )?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_header_names}, Signature={signature}",
        credentials.access_key_id
    );
    request
        .headers
        .insert(AUTHORIZATION, header_value(&authorization)?);

    Ok(())
}

/// RFC 3986 percent-encoding as SigV4 requires: unreserved characters pass
/// through, everything else becomes uppercase `%XX`. `/` passes through in
/// paths (`encode_slash == false`) and is encoded in query components.
pub(crate) fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn canonical_query_string(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    if query.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort();

    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ClientError::Signing(format!("hmac init: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| ClientError::Signing(format!("invalid header value: {value}")))
}
