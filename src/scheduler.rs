//! The work scheduler: one cooperative task pairing idle connections with
//! runnable requests
//!
//! Everything that mutates meta-request state machines runs here, on a
//! single spawned task, so the machines need no locks. Producers — user
//! submissions, VIP lifecycle, dispatch completions, retry timers — push
//! into the mutex-protected queues in [`SyncedData`] and wake the worker;
//! the worker drains them in one pass:
//!
//! 1. drain VIP-connection updates and completed dispatches
//! 2. intake newly submitted meta-requests
//! 3. dispatch: while an idle slot, backpressure room, and a ready request
//!    line up, spawn a dispatch future (round-robin across meta-requests)
//! 4. finalize finished meta-requests and re-check for residual work
//!
//! Dispatch futures do the slow parts (connection acquire, signing, the
//! round trip) off the worker and marshal the outcome back through the
//! completion queue. The scheduler itself never blocks.

use crate::client::ClientInner;
use crate::error::{ClientError, Result};
use crate::meta_request::{MetaShared, NextRequest, StateMachine};
use crate::net::HttpResponse;
use crate::request::{Request, RequestKind};
use crate::signing::sign_request;
use crate::vip::{Vip, VipConnection};
use crate::xml;
use chrono::Utc;
use http::StatusCode;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

/// A VIP-connection lifecycle change bound for the worker's idle list
pub(crate) enum VipConnectionUpdate {
    /// A freshly created slot joins the idle list
    Add(VipConnection),
    /// Every idle slot for this address is torn down
    Remove(IpAddr),
}

/// A dispatch future's result, marshalled back to the worker
pub(crate) struct CompletedDispatch {
    pub slot: VipConnection,
    pub shared: Arc<MetaShared>,
    pub request: Request,
    pub outcome: Result<HttpResponse>,
}

/// A submitted meta-request waiting for worker intake
pub(crate) struct PendingMetaRequest {
    pub shared: Arc<MetaShared>,
    pub machine: Box<dyn StateMachine>,
}

/// Producer-side queues and flags, guarded by the client's mutex
pub(crate) struct SyncedData {
    /// Clear once client teardown starts
    pub active: bool,
    /// Whether a worker wake-up is already pending
    pub work_scheduled: bool,
    /// Live VIPs, at most one per address
    pub vips: Vec<Arc<Vip>>,
    /// Addresses creation is currently in flight for
    pub creating: std::collections::HashSet<IpAddr>,
    /// Every address the host listener currently reports
    pub known_addresses: std::collections::HashSet<IpAddr>,
    pub pending_updates: Vec<VipConnectionUpdate>,
    pub pending_meta_requests: Vec<PendingMetaRequest>,
    pub completed: Vec<CompletedDispatch>,
    pub retry_ready: Vec<(Arc<MetaShared>, Request)>,
}

impl SyncedData {
    pub(crate) fn new() -> Self {
        Self {
            active: true,
            work_scheduled: false,
            vips: Vec::new(),
            creating: std::collections::HashSet::new(),
            known_addresses: std::collections::HashSet::new(),
            pending_updates: Vec::new(),
            pending_meta_requests: Vec::new(),
            completed: Vec::new(),
            retry_ready: Vec::new(),
        }
    }
}

/// One pass worth of drained producer queues
pub(crate) struct Batch {
    pub active: bool,
    pub updates: Vec<VipConnectionUpdate>,
    pub new_meta_requests: Vec<PendingMetaRequest>,
    pub completed: Vec<CompletedDispatch>,
    pub retry_ready: Vec<(Arc<MetaShared>, Request)>,
}

struct ActiveMetaRequest {
    shared: Arc<MetaShared>,
    machine: Box<dyn StateMachine>,
}

/// Worker-task-private state. Nothing here is shared; the worker owns it
/// outright, which is what makes the state machines lock-free.
#[derive(Default)]
struct ThreadedData {
    idle: VecDeque<VipConnection>,
    meta_requests: Vec<ActiveMetaRequest>,
    /// Round-robin cursor over `meta_requests`, adjusted on removal
    cursor: usize,
}

impl ThreadedData {
    fn meta_mut(&mut self, id: u64) -> Option<&mut ActiveMetaRequest> {
        self.meta_requests.iter_mut().find(|m| m.shared.id == id)
    }
}

/// The worker task entry point. Runs until the client is torn down and
/// every meta-request, slot, and in-flight dispatch has drained.
pub(crate) async fn run_worker(inner: Arc<ClientInner>) {
    let mut td = ThreadedData::default();
    loop {
        inner.work_notify.notified().await;
        loop {
            let batch = inner.take_batch();
            process_pass(&inner, &mut td, batch).await;
            if !inner.has_pending_work() {
                break;
            }
        }
        if worker_done(&inner, &td) {
            break;
        }
    }
    tracing::debug!("scheduler worker exiting");
    inner.internal_refs.release();
}

fn worker_done(inner: &Arc<ClientInner>, td: &ThreadedData) -> bool {
    !inner.is_active()
        && td.meta_requests.is_empty()
        && td.idle.is_empty()
        && inner.backpressure.requests_in_flight() == 0
        && !inner.has_pending_work()
}

async fn process_pass(inner: &Arc<ClientInner>, td: &mut ThreadedData, batch: Batch) {
    let active = batch.active;

    // Phase 1: connection updates, completions, retry re-entries.
    for update in batch.updates {
        match update {
            VipConnectionUpdate::Add(slot) => {
                if active && slot.vip.is_active() {
                    td.idle.push_back(slot);
                } else {
                    slot.dispose().await;
                }
            }
            VipConnectionUpdate::Remove(address) => {
                let mut kept = VecDeque::with_capacity(td.idle.len());
                while let Some(slot) = td.idle.pop_front() {
                    if slot.vip.address == address {
                        slot.dispose().await;
                    } else {
                        kept.push_back(slot);
                    }
                }
                td.idle = kept;
            }
        }
    }

    for completed in batch.completed {
        handle_completion(inner, td, completed).await;
    }

    for (shared, request) in batch.retry_ready {
        if let Some(meta) = td.meta_mut(shared.id) {
            meta.machine.requeue(request);
        }
        // The retry timer's reference ends here; the machine's queue and
        // `is_finished` carry the pending work from now on.
        shared.refs.release();
    }

    // Phase 2: intake.
    for pending in batch.new_meta_requests {
        if active {
            tracing::debug!(meta_request = pending.shared.id, "meta request active");
            td.meta_requests.push(ActiveMetaRequest {
                shared: pending.shared,
                machine: pending.machine,
            });
        } else {
            // Submitted concurrently with teardown; finish it untouched.
            pending.shared.set_error(ClientError::Cancelled);
            pending.shared.stream.close();
            pending.shared.finish();
            inner.meta_request_finished();
        }
    }

    // Cancellation sweep (user cancels, and everything when tearing down).
    for meta in td.meta_requests.iter_mut() {
        let cancelling = meta.shared.cancelled() || !active;
        if cancelling && meta.shared.take_cancel_ack() {
            tracing::debug!(meta_request = meta.shared.id, "cancelling");
            meta.shared.set_error(ClientError::Cancelled);
            meta.machine.on_cancel();
        }
        if !active {
            // No dispatches will happen again; fail whatever the machine
            // still wants to send (including best-effort aborts).
            loop {
                match meta.machine.next_request() {
                    NextRequest::Ready(request) => meta.machine.on_fatal(request),
                    NextRequest::NotYet | NextRequest::Finished => break,
                }
            }
        }
    }

    // Phase 3: dispatch.
    if active {
        dispatch_ready(inner, td).await;
    } else {
        while let Some(slot) = td.idle.pop_front() {
            slot.dispose().await;
        }
    }

    // Phase 4: finalize drained meta-requests.
    let mut index = 0;
    while index < td.meta_requests.len() {
        let meta = &td.meta_requests[index];
        if meta.machine.is_finished() && meta.shared.refs.count() == 0 {
            let meta = td.meta_requests.remove(index);
            if td.cursor > index {
                td.cursor -= 1;
            }
            tracing::debug!(meta_request = meta.shared.id, "meta request finished");
            meta.shared.stream.close();
            meta.shared.finish();
            inner.meta_request_finished();
        } else {
            index += 1;
        }
    }
    if td.cursor >= td.meta_requests.len() {
        td.cursor = 0;
    }
}

async fn dispatch_ready(inner: &Arc<ClientInner>, td: &mut ThreadedData) {
    'dispatch: loop {
        if td.meta_requests.is_empty() {
            return;
        }

        // Pop an idle slot, discarding any whose VIP died in place.
        let slot = loop {
            match td.idle.pop_front() {
                Some(slot) if slot.vip.is_active() => break slot,
                Some(slot) => slot.dispose().await,
                None => return,
            }
        };

        if !inner.backpressure.try_begin_request() {
            tracing::trace!("dispatch paused: backpressure");
            td.idle.push_front(slot);
            return;
        }

        // Round-robin across meta-requests for the next ready request.
        let count = td.meta_requests.len();
        for offset in 0..count {
            let index = (td.cursor + offset) % count;
            match td.meta_requests[index].machine.next_request() {
                NextRequest::Ready(request) => {
                    td.cursor = (index + 1) % count;
                    let shared = Arc::clone(&td.meta_requests[index].shared);
                    spawn_dispatch(inner, slot, shared, request);
                    continue 'dispatch;
                }
                NextRequest::NotYet | NextRequest::Finished => continue,
            }
        }

        {
            inner.backpressure.end_request();
            td.idle.push_front(slot);
            return;
        }
    }
}

fn spawn_dispatch(
    inner: &Arc<ClientInner>,
    mut slot: VipConnection,
    shared: Arc<MetaShared>,
    request: Request,
) {
    shared.refs.acquire();
    shared.inc_in_flight();
    inner.internal_refs.acquire();

    tracing::trace!(
        meta_request = shared.id,
        kind = ?request.kind,
        part = request.part_index,
        vip = %slot.vip.address,
        "dispatching"
    );

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let outcome = execute_request(&inner, &mut slot, &shared, &request).await;
        inner.complete_dispatch(CompletedDispatch {
            slot,
            shared,
            request,
            outcome,
        });
    });
}

/// The asynchronous half of a dispatch: ensure the slot holds a live
/// connection (rotating exhausted or closed ones), build and sign the wire
/// request, run the round trip, and collect the response.
async fn execute_request(
    inner: &Arc<ClientInner>,
    slot: &mut VipConnection,
    shared: &Arc<MetaShared>,
    request: &Request,
) -> Result<HttpResponse> {
    // A cancelled meta-request's outcomes are discarded anyway; skip the
    // network. Aborts still go out.
    if shared.cancelled() && request.kind != RequestKind::AbortMultipartUpload {
        return Err(ClientError::Cancelled);
    }

    let rotate = match &slot.conn {
        None => true,
        Some(conn) => {
            !conn.is_open() || slot.request_count >= inner.config.max_requests_per_connection
        }
    };
    if rotate {
        if let Some(old) = slot.conn.take() {
            tracing::debug!(vip = %slot.vip.address, served = slot.request_count, "rotating connection");
            slot.vip.manager.release(old, false).await;
        }
        let conn = slot.vip.manager.acquire().await?;
        slot.conn = Some(conn);
        slot.request_count = 0;
    }

    let upload_id = shared.upload_id();
    let mut http_request =
        request.to_http(&shared.template, &slot.vip.host_address, upload_id.as_deref())?;
    sign_request(&mut http_request, &shared.signing, Utc::now())?;

    slot.request_count += 1;
    let Some(conn) = slot.conn.as_mut() else {
        return Err(ClientError::Internal("slot lost its connection".to_string()));
    };
    match conn.execute(http_request).await {
        Ok(response) => Ok(response),
        Err(error) => {
            // Connection-level failure: never hand this connection out again.
            if let Some(bad) = slot.conn.take() {
                slot.vip.manager.release(bad, false).await;
            }
            Err(error)
        }
    }
}

async fn handle_completion(
    inner: &Arc<ClientInner>,
    td: &mut ThreadedData,
    completed: CompletedDispatch,
) {
    let CompletedDispatch {
        slot,
        shared,
        request,
        outcome,
    } = completed;

    inner.backpressure.end_request();
    shared.dec_in_flight();
    inner.internal_refs.release();

    if slot.vip.is_active() && inner.is_active() {
        td.idle.push_back(slot);
    } else {
        slot.dispose().await;
    }

    let Some(meta) = td.meta_mut(shared.id) else {
        // Only reachable if bookkeeping drifted; never drop the reference.
        tracing::debug!(meta_request = shared.id, "completion for unknown meta request");
        shared.refs.release();
        return;
    };

    let is_abort = request.kind == RequestKind::AbortMultipartUpload;
    if (shared.cancelled() || shared.has_error()) && !is_abort {
        // The sticky error is already decided; later outcomes are logged
        // and dropped.
        if let Err(error) = &outcome {
            tracing::debug!(meta_request = shared.id, %error, "dropping outcome after sticky error");
        }
        shared.refs.release();
        return;
    }

    match outcome {
        Ok(response) => {
            let status = response.status;
            // The preflight's 416 is part of its protocol (empty object),
            // not a failure; everything else non-2xx is classified below.
            let machine_handles = status.is_success()
                || (request.kind == RequestKind::RangedPreflight
                    && status == StatusCode::RANGE_NOT_SATISFIABLE);
            if machine_handles {
                shared.record_response_status(status.as_u16());
                inner.retry.record_success();
                meta.machine.on_success(request, response);
            } else {
                let code = xml::root_error_code(&response.body_str());
                let error = ClientError::HttpStatus {
                    status: status.as_u16(),
                    code,
                };
                fail_or_retry(inner, meta, request, error);
            }
        }
        Err(error) => fail_or_retry(inner, meta, request, error),
    }

    shared.refs.release();
}

/// The retry controller: transient errors spend a token and re-enter after
/// a jittered backoff; everything else (or a dry budget) becomes the
/// meta-request's sticky error.
fn fail_or_retry(
    inner: &Arc<ClientInner>,
    meta: &mut ActiveMetaRequest,
    mut request: Request,
    error: ClientError,
) {
    if request.kind == RequestKind::AbortMultipartUpload {
        // Abort is best-effort; the machine logs and finishes.
        meta.machine.on_fatal(request);
        return;
    }

    let mut final_error = error;
    if final_error.is_retriable() && inner.retry.retries_remaining(request.retries) {
        match inner.retry.try_acquire_token() {
            Ok(()) => {
                request.retries += 1;
                let delay = jittered_backoff(inner, request.retries);
                tracing::debug!(
                    meta_request = meta.shared.id,
                    kind = ?request.kind,
                    part = request.part_index,
                    attempt = request.retries,
                    ?delay,
                    error = %final_error,
                    "retrying"
                );

                let shared = Arc::clone(&meta.shared);
                shared.refs.acquire();
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.push_retry_ready(shared, request);
                });
                return;
            }
            Err(_) => {
                final_error = ClientError::RetryBudgetExhausted {
                    attempts: request.retries,
                };
            }
        }
    }

    tracing::debug!(
        meta_request = meta.shared.id,
        kind = ?request.kind,
        part = request.part_index,
        error = %final_error,
        "request failed permanently"
    );
    meta.shared.set_error(final_error);
    meta.machine.on_fatal(request);
}

fn jittered_backoff(inner: &Arc<ClientInner>, attempt: u32) -> std::time::Duration {
    use rand::Rng;
    let base = inner.retry.backoff_for(attempt);
    let jitter = rand::rng().random_range(0.0..0.3);
    base + base.mul_f64(jitter)
}
