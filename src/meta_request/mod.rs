//! Meta-requests: logical transfers decomposed into many HTTP requests
//!
//! A meta-request is what the user submits — "get this object", "put this
//! object" — and what the scheduler drives to completion. Each variant is a
//! state machine with a uniform face: hand me your next ready request, and
//! hear about every completed one. All state-machine transitions run on the
//! worker task; the pieces touched from other threads (cancel flag, sticky
//! result, in-flight counter, streaming queue) live in the shared block and
//! are individually synchronized.

mod default;
mod get;
mod put;

pub(crate) use default::DefaultMetaRequest;
pub(crate) use get::AutoRangedGetMetaRequest;
pub(crate) use put::MultipartPutMetaRequest;

use crate::config::MAX_UPLOAD_PARTS;
use crate::error::{ClientError, Result};
use crate::request::{MessageTemplate, Request};
use crate::signing::CachedSigningConfig;
use crate::streaming::StreamingQueue;
use slingshot_core_resilience::{BackpressureGuard, RefCount};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// The kind of logical transfer a meta-request performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaRequestKind {
    /// Single passthrough request
    Default,
    /// Object download as parallel ranged GETs
    GetObject,
    /// Object upload as a multipart upload
    PutObject,
}

/// Body delivery callback: `(object_offset, bytes)`, invoked on the
/// body-streaming runtime in strict object order.
pub type BodyCallback = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

/// Completion callback, invoked exactly once per meta-request.
pub type FinishCallback = Box<dyn FnOnce(MetaRequestResult) + Send>;

/// Options for submitting a meta-request
pub struct MetaRequestOptions {
    /// Transfer kind
    pub kind: MetaRequestKind,
    /// HTTP message template the transfer derives its requests from
    pub message: MessageTemplate,
    /// Ordered body delivery (GET and Default)
    pub body_callback: Option<BodyCallback>,
    /// Completion notification
    pub finish_callback: Option<FinishCallback>,
    /// Override the client's signing config for this transfer
    pub signing_override: Option<crate::signing::SigningConfig>,
}

impl MetaRequestOptions {
    /// Options with just a kind and message.
    pub fn new(kind: MetaRequestKind, message: MessageTemplate) -> Self {
        Self {
            kind,
            message,
            body_callback: None,
            finish_callback: None,
            signing_override: None,
        }
    }

    /// Set the body callback.
    pub fn on_body(mut self, callback: BodyCallback) -> Self {
        self.body_callback = Some(callback);
        self
    }

    /// Set the finish callback.
    pub fn on_finish(mut self, callback: FinishCallback) -> Self {
        self.finish_callback = Some(callback);
        self
    }
}

/// Final outcome of a meta-request
#[derive(Debug)]
pub struct MetaRequestResult {
    /// The sticky error, absent on success
    pub error: Option<ClientError>,
    /// Status of the most relevant HTTP response (the failing one on error,
    /// the final one on success)
    pub response_status: Option<u16>,
    /// Upload id, present for multipart PUTs that got far enough to create
    /// one — useful for out-of-band abort/diagnostics
    pub upload_id: Option<String>,
}

impl MetaRequestResult {
    /// Whether the transfer completed successfully.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// User handle for an in-flight meta-request. Dropping the handle does not
/// cancel the transfer; call [`cancel`](Self::cancel) for that.
pub struct MetaRequest {
    pub(crate) shared: Arc<MetaShared>,
    pub(crate) client: std::sync::Weak<crate::client::ClientInner>,
}

impl MetaRequest {
    /// Request cancellation. The next scheduler pass stops issuing work,
    /// discards in-flight outcomes, and finishes the meta-request with
    /// [`ClientError::Cancelled`]; a multipart PUT additionally attempts
    /// AbortMultipartUpload.
    pub fn cancel(&self) {
        self.shared.cancel();
        if let Some(client) = self.client.upgrade() {
            client.schedule_work();
        }
    }

    /// Identifier for log correlation.
    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

#[derive(Debug, Default)]
struct ResultState {
    error: Option<ClientError>,
    response_status: Option<u16>,
}

/// State shared between the user handle, the worker, dispatch futures, and
/// the streaming task.
pub(crate) struct MetaShared {
    pub id: u64,
    pub kind: MetaRequestKind,
    pub template: MessageTemplate,
    pub signing: Arc<CachedSigningConfig>,
    pub part_size: u64,
    window: u32,
    pub body_callback: Option<BodyCallback>,
    finish_callback: Mutex<Option<FinishCallback>>,
    pub stream: StreamingQueue,
    /// In-flight requests, pending retries, and undelivered stream entries
    pub refs: RefCount,
    parts_in_flight: AtomicU32,
    cancelled: AtomicBool,
    cancel_acked: AtomicBool,
    finished: AtomicBool,
    result: Mutex<ResultState>,
    upload_id: Mutex<Option<String>>,
}

impl MetaShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        kind: MetaRequestKind,
        template: MessageTemplate,
        signing: Arc<CachedSigningConfig>,
        part_size: u64,
        window: u32,
        body_callback: Option<BodyCallback>,
        finish_callback: Option<FinishCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            template,
            signing,
            part_size,
            window,
            body_callback,
            finish_callback: Mutex::new(finish_callback),
            stream: StreamingQueue::new(),
            refs: RefCount::new(0),
            parts_in_flight: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            cancel_acked: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            result: Mutex::new(ResultState::default()),
            upload_id: Mutex::new(None),
        })
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Worker-side: true exactly once, when the cancel flag is first seen.
    pub(crate) fn take_cancel_ack(&self) -> bool {
        !self.cancel_acked.swap(true, Ordering::SeqCst)
    }

    /// Record the sticky error. Only the first error wins; later failures
    /// are logged by the caller and dropped.
    pub(crate) fn set_error(&self, error: ClientError) {
        let mut result = self.result.lock().unwrap_or_else(|e| e.into_inner());
        if result.error.is_none() {
            if let Some(status) = error.response_status() {
                result.response_status = Some(status);
            }
            result.error = Some(error);
        } else {
            tracing::debug!(meta_request = self.id, error = %error, "dropping non-first error");
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        self.result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .is_some()
    }

    pub(crate) fn record_response_status(&self, status: u16) {
        let mut result = self.result.lock().unwrap_or_else(|e| e.into_inner());
        if result.error.is_none() {
            result.response_status = Some(status);
        }
    }

    pub(crate) fn set_upload_id(&self, id: String) {
        let mut upload_id = self.upload_id.lock().unwrap_or_else(|e| e.into_inner());
        *upload_id = Some(id);
    }

    pub(crate) fn upload_id(&self) -> Option<String> {
        self.upload_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn inc_in_flight(&self) {
        self.parts_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_in_flight(&self) {
        let prev = self.parts_in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "in-flight counter underflow");
    }

    pub(crate) fn window_open(&self) -> bool {
        self.parts_in_flight.load(Ordering::SeqCst) < self.window
    }

    /// Fire the finish callback. Safe to call more than once; only the
    /// first call delivers.
    pub(crate) fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = {
            let mut slot = self
                .finish_callback
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(callback) = callback {
            callback(self.build_result());
        }
    }

    fn build_result(&self) -> MetaRequestResult {
        let result = self.result.lock().unwrap_or_else(|e| e.into_inner());
        MetaRequestResult {
            error: result.error.clone(),
            response_status: result.response_status,
            upload_id: self.upload_id(),
        }
    }
}

/// What the scheduler hears when it asks a meta-request for work
pub(crate) enum NextRequest {
    /// Dispatch this now
    Ready(Request),
    /// Nothing runnable yet; completions will unblock more
    NotYet,
    /// The state machine will never produce another request
    Finished,
}

/// Uniform face of the three meta-request variants. Every method is called
/// from the worker task only.
pub(crate) trait StateMachine: Send {
    /// Next ready request, if any.
    fn next_request(&mut self) -> NextRequest;

    /// A request finished with a 2xx response (or the preflight's expected
    /// out-of-band statuses).
    fn on_success(&mut self, request: Request, response: crate::net::HttpResponse);

    /// A request failed for good; the sticky error is already recorded.
    fn on_fatal(&mut self, request: Request);

    /// A granted retry re-enters the machine's queue.
    fn requeue(&mut self, request: Request);

    /// The user cancelled; stop producing and unwind.
    fn on_cancel(&mut self);

    /// Whether the machine is done and holds no queued work. Unlike
    /// [`next_request`](Self::next_request) this must not mutate, so the
    /// finalization pass can poll it.
    fn is_finished(&self) -> bool;
}

/// Factory keyed on the meta-request variant.
pub(crate) fn create_state_machine(
    shared: Arc<MetaShared>,
    guard: Arc<BackpressureGuard>,
) -> Box<dyn StateMachine> {
    match shared.kind {
        MetaRequestKind::Default => Box::new(DefaultMetaRequest::new(shared, guard)),
        MetaRequestKind::GetObject => Box::new(AutoRangedGetMetaRequest::new(shared, guard)),
        MetaRequestKind::PutObject => Box::new(MultipartPutMetaRequest::new(shared)),
    }
}

/// Part size actually used for an upload of `object_len` bytes: the
/// configured size, scaled up when the object would otherwise exceed the
/// part-count cap, and rejected when even the scaled size cannot fit under
/// `max_part_size`.
pub(crate) fn resolve_part_size(
    object_len: u64,
    part_size: u64,
    max_part_size: u64,
) -> Result<u64> {
    let parts = object_len.div_ceil(part_size);
    if parts <= MAX_UPLOAD_PARTS {
        return Ok(part_size);
    }
    let scaled = object_len.div_ceil(MAX_UPLOAD_PARTS);
    if scaled > max_part_size {
        return Err(ClientError::InvalidArgument(format!(
            "object of {object_len} bytes needs parts of {scaled} bytes to stay under \
             {MAX_UPLOAD_PARTS} parts, above the {max_part_size} byte limit"
        )));
    }
    Ok(scaled)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_resolve_part_size_passthrough() {
        assert_eq!(resolve_part_size(100 * MIB, 8 * MIB, 64 * MIB).unwrap(), 8 * MIB);
    }

    #[test]
    fn test_resolve_part_size_scales_up() {
        // 100 000 MiB at 8 MiB parts would be 12 500 parts.
        let scaled = resolve_part_size(100_000 * MIB, 8 * MIB, 64 * MIB).unwrap();
        assert_eq!(scaled, (100_000 * MIB).div_ceil(MAX_UPLOAD_PARTS));
        assert!(scaled > 8 * MIB);
        assert!((100_000 * MIB).div_ceil(scaled) <= MAX_UPLOAD_PARTS);
    }

    #[test]
    fn test_resolve_part_size_rejects_oversize() {
        // Scaling past max_part_size is an invalid argument.
        let result = resolve_part_size(2_000_000 * MIB, 8 * MIB, 64 * MIB);
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_sticky_error_keeps_first() {
        let shared = test_shared();
        shared.set_error(ClientError::HttpStatus {
            status: 403,
            code: None,
        });
        shared.set_error(ClientError::Cancelled);

        let result = shared.build_result();
        assert!(matches!(
            result.error,
            Some(ClientError::HttpStatus { status: 403, .. })
        ));
        assert_eq!(result.response_status, Some(403));
    }

    #[test]
    fn test_response_status_not_overwritten_after_error() {
        let shared = test_shared();
        shared.set_error(ClientError::HttpStatus {
            status: 503,
            code: None,
        });
        shared.record_response_status(200);
        assert_eq!(shared.build_result().response_status, Some(503));
    }

    #[test]
    fn test_cancel_ack_fires_once() {
        let shared = test_shared();
        shared.cancel();
        assert!(shared.take_cancel_ack());
        assert!(!shared.take_cancel_ack());
    }

    #[test]
    fn test_finish_delivers_once() {
        use std::sync::atomic::AtomicUsize;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let shared = MetaShared::new(
            1,
            MetaRequestKind::Default,
            MessageTemplate::get("/k"),
            test_signing(),
            8 * MIB,
            16,
            None,
            Some(Box::new(move |_result| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        shared.finish();
        shared.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_window_gates_in_flight() {
        let shared = MetaShared::new(
            1,
            MetaRequestKind::GetObject,
            MessageTemplate::get("/k"),
            test_signing(),
            8 * MIB,
            2,
            None,
            None,
        );
        assert!(shared.window_open());
        shared.inc_in_flight();
        assert!(shared.window_open());
        shared.inc_in_flight();
        assert!(!shared.window_open());
        shared.dec_in_flight();
        assert!(shared.window_open());
    }

    fn test_signing() -> Arc<CachedSigningConfig> {
        use crate::signing::{Credentials, SigningConfig, StaticCredentialsProvider};
        let provider = Arc::new(StaticCredentialsProvider::new(Credentials::new("ak", "sk")));
        Arc::new(CachedSigningConfig::new(&SigningConfig::default_for(
            "us-east-1",
            provider,
        )))
    }

    fn test_shared() -> Arc<MetaShared> {
        MetaShared::new(
            1,
            MetaRequestKind::GetObject,
            MessageTemplate::get("/k"),
            test_signing(),
            8 * MIB,
            16,
            None,
            None,
        )
    }
}
