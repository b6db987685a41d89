//! Auto-ranged GET: download an object as parallel ranged parts
//!
//! The first request is a one-byte probe (`Range: bytes=0-0`): a 206 tells
//! us the total length via `Content-Range` and confirms range support, at
//! the cost of a single wasted byte. From there the machine issues ranged
//! parts inside the in-flight window. Objects that fit in one part degrade
//! to a single whole-object GET; a server that ignores the probe's Range
//! and answers 200 has already sent the whole object, which is accepted
//! as-is; a 416 against an empty object completes with zero body bytes.

use super::{MetaShared, NextRequest, StateMachine};
use crate::error::ClientError;
use crate::net::HttpResponse;
use crate::request::{Request, RequestKind};
use crate::streaming::StreamedPart;
use bytes::Bytes;
use http::header::CONTENT_RANGE;
use http::StatusCode;
use slingshot_core_resilience::BackpressureGuard;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GetState {
    Preflight { issued: bool },
    Streaming,
    WholeObject { issued: bool },
    Done,
}

pub(crate) struct AutoRangedGetMetaRequest {
    shared: Arc<MetaShared>,
    guard: Arc<BackpressureGuard>,
    state: GetState,
    retry_queue: VecDeque<Request>,
    total_length: u64,
    num_parts: u32,
    next_part: u32,
    parts_completed: u32,
}

impl AutoRangedGetMetaRequest {
    pub(crate) fn new(shared: Arc<MetaShared>, guard: Arc<BackpressureGuard>) -> Self {
        Self {
            shared,
            guard,
            state: GetState::Preflight { issued: false },
            retry_queue: VecDeque::new(),
            total_length: 0,
            num_parts: 0,
            next_part: 0,
            parts_completed: 0,
        }
    }

    fn push_part(&self, part_index: u32, offset: u64, body: Bytes) {
        self.shared.refs.acquire();
        self.guard.add_buffered(body.len() as u64);
        self.shared.stream.push(StreamedPart {
            part_index,
            offset,
            body,
        });
    }

    fn fail(&mut self, error: ClientError) {
        self.shared.set_error(error);
        self.unwind();
    }

    fn unwind(&mut self) {
        self.state = GetState::Done;
        let (entries, bytes) = self.shared.stream.clear();
        self.guard.remove_buffered(bytes);
        for _ in 0..entries {
            self.shared.refs.release();
        }
        self.shared.stream.close();
    }

    fn handle_preflight(&mut self, response: HttpResponse) {
        let status = response.status;
        if status == StatusCode::PARTIAL_CONTENT {
            let total = response
                .header_str(CONTENT_RANGE.as_str())
                .and_then(content_range_total);
            let Some(total) = total else {
                self.fail(ClientError::Internal(
                    "preflight 206 without a usable Content-Range".to_string(),
                ));
                return;
            };
            if total <= self.shared.part_size {
                // Whole object fits in one part; re-fetch it in one go and
                // drop the probe byte.
                self.state = GetState::WholeObject { issued: false };
            } else {
                self.total_length = total;
                self.num_parts = total.div_ceil(self.shared.part_size) as u32;
                self.state = GetState::Streaming;
            }
        } else if status == StatusCode::OK {
            // Server ignored the Range header and sent everything.
            self.total_length = response.body.len() as u64;
            self.num_parts = 1;
            self.parts_completed = 1;
            self.push_part(0, 0, response.body);
            self.state = GetState::Done;
            self.shared.stream.close();
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // `bytes */0`: the object is empty. Success, no body bytes.
            let empty = response
                .header_str(CONTENT_RANGE.as_str())
                .and_then(content_range_total)
                == Some(0);
            if empty {
                self.total_length = 0;
                self.num_parts = 0;
                self.state = GetState::Done;
                self.shared.stream.close();
            } else {
                self.fail(ClientError::HttpStatus {
                    status: 416,
                    code: None,
                });
            }
        } else {
            self.fail(ClientError::Internal(format!(
                "unexpected preflight status {status}"
            )));
        }
    }
}

impl StateMachine for AutoRangedGetMetaRequest {
    fn next_request(&mut self) -> NextRequest {
        if let Some(request) = self.retry_queue.pop_front() {
            return NextRequest::Ready(request);
        }

        match self.state {
            GetState::Preflight { issued: false } => {
                self.state = GetState::Preflight { issued: true };
                NextRequest::Ready(Request::ranged_preflight())
            }
            GetState::Preflight { issued: true } => NextRequest::NotYet,
            GetState::Streaming => {
                if self.next_part < self.num_parts && self.shared.window_open() {
                    let index = self.next_part;
                    self.next_part += 1;
                    let start = u64::from(index) * self.shared.part_size;
                    let end = (start + self.shared.part_size).min(self.total_length) - 1;
                    NextRequest::Ready(Request::ranged_part(index, start, end))
                } else if self.parts_completed == self.num_parts {
                    NextRequest::Finished
                } else {
                    NextRequest::NotYet
                }
            }
            GetState::WholeObject { issued: false } => {
                self.state = GetState::WholeObject { issued: true };
                NextRequest::Ready(Request::whole_object())
            }
            GetState::WholeObject { issued: true } => NextRequest::NotYet,
            GetState::Done => NextRequest::Finished,
        }
    }

    fn on_success(&mut self, request: Request, response: HttpResponse) {
        match request.kind {
            RequestKind::RangedPreflight => self.handle_preflight(response),
            RequestKind::RangedPart => {
                let offset = u64::from(request.part_index) * self.shared.part_size;
                self.push_part(request.part_index, offset, response.body);
                self.parts_completed += 1;
                if self.parts_completed == self.num_parts {
                    self.state = GetState::Done;
                    self.shared.stream.close();
                }
            }
            RequestKind::WholeObject => {
                self.total_length = response.body.len() as u64;
                self.num_parts = 1;
                self.parts_completed = 1;
                self.push_part(0, 0, response.body);
                self.state = GetState::Done;
                self.shared.stream.close();
            }
            other => {
                tracing::debug!(meta_request = self.shared.id, kind = ?other, "unexpected completion");
            }
        }
    }

    fn on_fatal(&mut self, _request: Request) {
        self.unwind();
    }

    fn requeue(&mut self, request: Request) {
        self.retry_queue.push_back(request);
    }

    fn on_cancel(&mut self) {
        self.unwind();
    }

    fn is_finished(&self) -> bool {
        self.state == GetState::Done && self.retry_queue.is_empty()
    }
}

/// Total object length from a `Content-Range` value: `bytes 0-0/1024` or
/// `bytes */0`. `None` for an unknown (`/*`) or malformed total.
fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
