//! Single-request descriptors and wire-request issuance
//!
//! A meta-request never touches the wire itself; it emits `Request`
//! descriptors and the dispatch path turns each one into a signed
//! [`HttpRequest`](crate::net::HttpRequest) by substituting the descriptor's
//! range/body/query into the meta-request's message template.

use crate::error::{ClientError, Result};
use crate::net::HttpRequest;
use crate::signing::uri_encode;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, RANGE};
use http::Method;

/// The user-supplied HTTP message template a meta-request is built from.
///
/// The path is the *unencoded* object path; issuance percent-encodes it.
/// Extra headers are carried onto every derived request.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    /// HTTP method of the logical operation
    pub method: Method,
    /// Unencoded object path, starting with `/`
    pub path: String,
    /// Pre-encoded query string carried onto derived requests
    pub query: Option<String>,
    /// Headers applied to every derived request
    pub headers: HeaderMap,
    /// Object body for uploads
    pub body: Bytes,
}

impl MessageTemplate {
    /// Template for downloading an object.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Template for uploading an object.
    pub fn put(path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(ClientError::InvalidArgument(format!(
                "template path must start with '/', got: {}",
                self.path
            )));
        }
        Ok(())
    }
}

/// What a single request does on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// Default meta-request: the template, passed through unchanged
    Passthrough,
    /// `Range: bytes=0-0` probe discovering object length and range support
    RangedPreflight,
    /// One ranged GET part
    RangedPart,
    /// Whole-object GET (small-object degrade)
    WholeObject,
    /// `POST ?uploads`
    CreateMultipartUpload,
    /// `PUT ?partNumber=N&uploadId=…`
    UploadPart,
    /// `POST ?uploadId=…` with the part-list body
    CompleteMultipartUpload,
    /// `DELETE ?uploadId=…`, best-effort
    AbortMultipartUpload,
}

impl RequestKind {
    pub(crate) fn needs_upload_id(self) -> bool {
        matches!(
            self,
            RequestKind::UploadPart
                | RequestKind::CompleteMultipartUpload
                | RequestKind::AbortMultipartUpload
        )
    }
}

/// One HTTP round trip derived from a meta-request
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub kind: RequestKind,
    /// 0-based part index; the wire part number is `part_index + 1`
    pub part_index: u32,
    /// Inclusive byte range for ranged GETs
    pub range: Option<(u64, u64)>,
    /// Part body (PUT) or XML body (Complete)
    pub body: Bytes,
    /// Retries performed so far
    pub retries: u32,
}

impl Request {
    pub(crate) fn passthrough(body: Bytes) -> Self {
        Self::new(RequestKind::Passthrough, 0, None, body)
    }

    pub(crate) fn ranged_preflight() -> Self {
        Self::new(RequestKind::RangedPreflight, 0, Some((0, 0)), Bytes::new())
    }

    pub(crate) fn ranged_part(part_index: u32, start: u64, end: u64) -> Self {
        Self::new(
            RequestKind::RangedPart,
            part_index,
            Some((start, end)),
            Bytes::new(),
        )
    }

    pub(crate) fn whole_object() -> Self {
        Self::new(RequestKind::WholeObject, 0, None, Bytes::new())
    }

    pub(crate) fn create_multipart_upload() -> Self {
        Self::new(RequestKind::CreateMultipartUpload, 0, None, Bytes::new())
    }

    pub(crate) fn upload_part(part_index: u32, body: Bytes) -> Self {
        Self::new(RequestKind::UploadPart, part_index, None, body)
    }

    pub(crate) fn complete_multipart_upload(body: Bytes) -> Self {
        Self::new(RequestKind::CompleteMultipartUpload, 0, None, body)
    }

    pub(crate) fn abort_multipart_upload() -> Self {
        Self::new(RequestKind::AbortMultipartUpload, 0, None, Bytes::new())
    }

    fn new(kind: RequestKind, part_index: u32, range: Option<(u64, u64)>, body: Bytes) -> Self {
        Self {
            kind,
            part_index,
            range,
            body,
            retries: 0,
        }
    }

    /// Build the wire request: clone the template headers, substitute host,
    /// range or body, path and query for this request's kind.
    pub(crate) fn to_http(
        &self,
        template: &MessageTemplate,
        host: &str,
        upload_id: Option<&str>,
    ) -> Result<HttpRequest> {
        if self.kind.needs_upload_id() && upload_id.is_none() {
            return Err(ClientError::Internal(format!(
                "{:?} issued without an upload id",
                self.kind
            )));
        }

        let mut headers = template.headers.clone();
        headers.insert(
            HOST,
            HeaderValue::from_str(host)
                .map_err(|_| ClientError::InvalidArgument(format!("invalid host: {host}")))?,
        );
        // The transport derives Content-Length from the substituted body; a
        // stale template value must not leak through.
        headers.remove(CONTENT_LENGTH);

        let (method, body) = match self.kind {
            RequestKind::Passthrough => (template.method.clone(), self.body.clone()),
            RequestKind::RangedPreflight | RequestKind::RangedPart | RequestKind::WholeObject => {
                (Method::GET, Bytes::new())
            }
            RequestKind::CreateMultipartUpload => (Method::POST, Bytes::new()),
            RequestKind::UploadPart => (Method::PUT, self.body.clone()),
            RequestKind::CompleteMultipartUpload => (Method::POST, self.body.clone()),
            RequestKind::AbortMultipartUpload => (Method::DELETE, Bytes::new()),
        };

        if let Some((start, end)) = self.range {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&format!("bytes={start}-{end}"))
                    .map_err(|_| ClientError::Internal("invalid range header".to_string()))?,
            );
        }

        let query = self.build_query(template, upload_id);

        Ok(HttpRequest {
            method,
            path: uri_encode(&template.path, false),
            query,
            headers,
            body,
        })
    }

    fn build_query(&self, template: &MessageTemplate, upload_id: Option<&str>) -> Option<String> {
        let operation_query = match self.kind {
            RequestKind::CreateMultipartUpload => Some("uploads".to_string()),
            RequestKind::UploadPart => upload_id.map(|id| {
                format!(
                    "partNumber={}&uploadId={}",
                    self.part_index + 1,
                    uri_encode(id, true)
                )
            }),
            RequestKind::CompleteMultipartUpload | RequestKind::AbortMultipartUpload => {
                upload_id.map(|id| format!("uploadId={}", uri_encode(id, true)))
            }
            _ => None,
        };

        match (template.query.as_deref(), operation_query) {
            (Some(base), Some(op)) => Some(format!("{base}&{op}")),
            (Some(base), None) => Some(base.to_string()),
            (None, op) => op,
        }
    }
}
