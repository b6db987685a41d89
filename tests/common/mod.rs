//! Shared test harness: a scripted in-memory S3 behind the connection
//! manager seam, so full transfers run with no network.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_RANGE, ETAG, RANGE};
use http::{HeaderMap, Method, StatusCode};
use slingshot::net::{
    ConnectionManager, ConnectionManagerFactory, HttpConnection, HttpRequest, HttpResponse,
};
use slingshot::{ClientError, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request as the mock service saw it
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub address: IpAddr,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub range: Option<(u64, u64)>,
    pub body_len: usize,
    pub signed: bool,
}

/// A scripted failure: the first `remaining` matching requests answer with
/// `status` (and an S3 error body when `code` is set).
pub struct FailureRule {
    pub method: Option<Method>,
    pub query_contains: Option<String>,
    pub range_start: Option<u64>,
    pub status: u16,
    pub code: Option<String>,
    pub remaining: u32,
}

#[derive(Default)]
struct UploadState {
    path: String,
    parts: HashMap<u32, (String, Bytes)>,
    complete_body: Option<String>,
    aborted: bool,
}

#[derive(Default)]
struct ServiceState {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, UploadState>,
    failures: Vec<FailureRule>,
    log: Vec<RequestRecord>,
}

/// In-memory S3 lookalike shared by every mock connection
pub struct MockService {
    state: Mutex<ServiceState>,
    latency: Duration,
    upload_counter: AtomicU64,
    etag_counter: AtomicU64,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServiceState::default()),
            latency,
            upload_counter: AtomicU64::new(0),
            etag_counter: AtomicU64::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        })
    }

    pub fn put_object(&self, path: &str, body: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(path.to_string(), body);
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub fn add_failure(&self, rule: FailureRule) {
        self.state.lock().unwrap().failures.push(rule);
    }

    pub fn log(&self) -> Vec<RequestRecord> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// The recorded CompleteMultipartUpload body for an upload id.
    pub fn complete_body(&self, upload_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .get(upload_id)
            .and_then(|u| u.complete_body.clone())
    }

    pub fn upload_aborted(&self, upload_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .uploads
            .get(upload_id)
            .map(|u| u.aborted)
            .unwrap_or(false)
    }

    /// ETags issued for an upload, in part order.
    pub fn upload_etags(&self, upload_id: &str) -> Vec<(u32, String)> {
        let state = self.state.lock().unwrap();
        let Some(upload) = state.uploads.get(upload_id) else {
            return Vec::new();
        };
        let mut etags: Vec<(u32, String)> = upload
            .parts
            .iter()
            .map(|(number, (etag, _))| (*number, etag.clone()))
            .collect();
        etags.sort();
        etags
    }

    async fn handle(&self, address: IpAddr, request: HttpRequest) -> HttpResponse {
        self.concurrent.fetch_add(1, Ordering::SeqCst);
        self.max_concurrent
            .fetch_max(self.concurrent.load(Ordering::SeqCst), Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let response = self.route(address, &request);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        response
    }

    fn route(&self, address: IpAddr, request: &HttpRequest) -> HttpResponse {
        let range = request
            .headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let mut state = self.state.lock().unwrap();
        state.log.push(RequestRecord {
            address,
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            range,
            body_len: request.body.len(),
            signed: request.headers.contains_key(AUTHORIZATION),
        });

        // Scripted failures first.
        for rule in state.failures.iter_mut() {
            if rule.remaining == 0 {
                continue;
            }
            let method_ok = rule.method.as_ref().map_or(true, |m| *m == request.method);
            let query_ok = rule.query_contains.as_ref().map_or(true, |needle| {
                request.query.as_deref().unwrap_or("").contains(needle.as_str())
            });
            let range_ok = rule
                .range_start
                .map_or(true, |start| range.map(|(s, _)| s) == Some(start));
            if method_ok && query_ok && range_ok {
                rule.remaining -= 1;
                let status = rule.status;
                let body = rule
                    .code
                    .as_ref()
                    .map(|code| format!("<Error><Code>{code}</Code></Error>"))
                    .unwrap_or_default();
                return error_response(status, body);
            }
        }

        let query = request.query.as_deref().unwrap_or("");
        let method = request.method.clone();

        if method == Method::GET {
            self.handle_get(&mut state, &request.path, range)
        } else if method == Method::POST && query == "uploads" {
            let id = format!(
                "upload-{}",
                self.upload_counter.fetch_add(1, Ordering::SeqCst) + 1
            );
            state.uploads.insert(
                id.clone(),
                UploadState {
                    path: request.path.clone(),
                    ..Default::default()
                },
            );
            xml_response(
                StatusCode::OK,
                format!(
                    "<InitiateMultipartUploadResult><UploadId>{id}</UploadId></InitiateMultipartUploadResult>"
                ),
            )
        } else if method == Method::PUT && query.contains("partNumber=") {
            let Some(upload_id) = query_param(query, "uploadId") else {
                return error_response(400, String::new());
            };
            let Some(part_number) =
                query_param(query, "partNumber").and_then(|n| n.parse::<u32>().ok())
            else {
                return error_response(400, String::new());
            };
            let etag = format!(
                "\"etag-{}\"",
                self.etag_counter.fetch_add(1, Ordering::SeqCst) + 1
            );
            let Some(upload) = state.uploads.get_mut(&upload_id) else {
                return error_response(404, "<Error><Code>NoSuchUpload</Code></Error>".into());
            };
            upload
                .parts
                .insert(part_number, (etag.clone(), request.body.clone()));
            let mut headers = HeaderMap::new();
            headers.insert(ETAG, HeaderValue::from_str(&etag).unwrap());
            HttpResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::new(),
            }
        } else if method == Method::POST {
            let Some(upload_id) = query_param(query, "uploadId") else {
                return error_response(400, String::new());
            };
            let Some(upload) = state.uploads.get_mut(&upload_id) else {
                return error_response(404, "<Error><Code>NoSuchUpload</Code></Error>".into());
            };
            upload.complete_body = Some(String::from_utf8_lossy(&request.body).into_owned());
            let mut numbers: Vec<u32> = upload.parts.keys().copied().collect();
            numbers.sort_unstable();
            let mut assembled = Vec::new();
            for number in numbers {
                assembled.extend_from_slice(&upload.parts[&number].1);
            }
            let path = upload.path.clone();
            state.objects.insert(path, Bytes::from(assembled));
            xml_response(
                StatusCode::OK,
                "<CompleteMultipartUploadResult></CompleteMultipartUploadResult>".to_string(),
            )
        } else if method == Method::DELETE {
            let Some(upload_id) = query_param(query, "uploadId") else {
                return error_response(400, String::new());
            };
            if let Some(upload) = state.uploads.get_mut(&upload_id) {
                upload.aborted = true;
            }
            HttpResponse {
                status: StatusCode::NO_CONTENT,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }
        } else {
            error_response(405, String::new())
        }
    }

    fn handle_get(
        &self,
        state: &mut ServiceState,
        path: &str,
        range: Option<(u64, u64)>,
    ) -> HttpResponse {
        let Some(object) = state.objects.get(path).cloned() else {
            return error_response(404, "<Error><Code>NoSuchKey</Code></Error>".into());
        };
        let len = object.len() as u64;

        let Some((start, end)) = range else {
            return HttpResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: object,
            };
        };

        if start >= len {
            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{len}")).unwrap(),
            );
            return HttpResponse {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                headers,
                body: Bytes::new(),
            };
        }

        let end = end.min(len - 1);
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")).unwrap(),
        );
        HttpResponse {
            status: StatusCode::PARTIAL_CONTENT,
            headers,
            body: object.slice(start as usize..=end as usize),
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn xml_response(status: StatusCode, body: String) -> HttpResponse {
    HttpResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from(body),
    }
}

fn error_response(status: u16, body: String) -> HttpResponse {
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: HeaderMap::new(),
        body: Bytes::from(body),
    }
}

/// Connection manager factory backed by the mock service
pub struct MockFactory {
    pub service: Arc<MockService>,
}

#[async_trait]
impl ConnectionManagerFactory for MockFactory {
    async fn create_manager(
        &self,
        _host: &str,
        address: IpAddr,
    ) -> Result<Arc<dyn ConnectionManager>> {
        Ok(Arc::new(MockManager {
            service: Arc::clone(&self.service),
            address,
        }))
    }
}

struct MockManager {
    service: Arc<MockService>,
    address: IpAddr,
}

#[async_trait]
impl ConnectionManager for MockManager {
    async fn acquire(&self) -> Result<Box<dyn HttpConnection>> {
        Ok(Box::new(MockConnection {
            service: Arc::clone(&self.service),
            address: self.address,
        }))
    }

    async fn release(&self, _conn: Box<dyn HttpConnection>, _reusable: bool) {}

    async fn shutdown(&self) {}
}

struct MockConnection {
    service: Arc<MockService>,
    address: IpAddr,
}

#[async_trait]
impl HttpConnection for MockConnection {
    async fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        if request.headers.get(AUTHORIZATION).is_none() {
            return Err(ClientError::Internal(
                "mock received an unsigned request".to_string(),
            ));
        }
        Ok(self.service.handle(self.address, request).await)
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// A client config wired to the mock service: no DNS, no TLS, small caps.
pub fn mock_client_config(service: &Arc<MockService>) -> slingshot::ClientConfig {
    use slingshot::signing::{Credentials, SigningConfig, StaticCredentialsProvider};

    // RUST_LOG=slingshot=trace is invaluable when a scenario hangs.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let provider = Arc::new(StaticCredentialsProvider::new(Credentials::new(
        "AKIDEXAMPLE",
        "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
    )));
    let mut config = slingshot::ClientConfig::new(
        "us-east-1",
        "bucket.s3.us-east-1.amazonaws.com",
        SigningConfig::default_for("us-east-1", provider),
    );
    config.dns_refresh_interval = None;
    config.manager_factory = Some(Arc::new(MockFactory {
        service: Arc::clone(service),
    }));
    config.retry.initial_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(50);
    config
}

/// Records ordered body callbacks for assertions.
#[derive(Default)]
pub struct BodyRecorder {
    chunks: Mutex<Vec<(u64, usize)>>,
}

impl BodyRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn callback(self: &Arc<Self>) -> slingshot::BodyCallback {
        let recorder = Arc::clone(self);
        Arc::new(move |offset, bytes| {
            recorder.chunks.lock().unwrap().push((offset, bytes.len()));
        })
    }

    pub fn chunks(&self) -> Vec<(u64, usize)> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.lock().unwrap().iter().map(|(_, len)| *len as u64).sum()
    }

    /// Offsets must be contiguous from zero with no gaps or overlaps.
    pub fn assert_in_order(&self) {
        let chunks = self.chunks();
        let mut expected_offset = 0u64;
        for (offset, len) in chunks {
            assert_eq!(offset, expected_offset, "body chunk out of order");
            expected_offset += len as u64;
        }
    }
}

/// Finish callback that resolves a oneshot with the result.
pub fn finish_channel() -> (
    slingshot::FinishCallback,
    tokio::sync::oneshot::Receiver<slingshot::MetaRequestResult>,
) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let callback: slingshot::FinishCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

/// Await a finish receiver with a hard timeout.
pub async fn await_finish(
    rx: tokio::sync::oneshot::Receiver<slingshot::MetaRequestResult>,
) -> slingshot::MetaRequestResult {
    tokio::time::timeout(Duration::from_secs(15), rx)
        .await
        .expect("meta request timed out")
        .expect("finish callback dropped")
}

/// A deterministic test body: position-dependent bytes so reassembly
/// mistakes show up as content mismatches.
pub fn patterned_body(len: usize) -> Bytes {
    let mut body = Vec::with_capacity(len);
    for i in 0..len {
        body.push((i % 251) as u8);
    }
    Bytes::from(body)
}
