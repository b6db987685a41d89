//! Default meta-request: a single passthrough round trip
//!
//! The template goes to the wire as-is (plus host substitution and
//! signing). The response body, if any, is still routed through the
//! streaming queue so user callbacks always run on the streaming runtime.

use super::{MetaShared, NextRequest, StateMachine};
use crate::net::HttpResponse;
use crate::request::Request;
use crate::streaming::StreamedPart;
use slingshot_core_resilience::BackpressureGuard;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) struct DefaultMetaRequest {
    shared: Arc<MetaShared>,
    guard: Arc<BackpressureGuard>,
    issued: bool,
    done: bool,
    retry_queue: VecDeque<Request>,
}

impl DefaultMetaRequest {
    pub(crate) fn new(shared: Arc<MetaShared>, guard: Arc<BackpressureGuard>) -> Self {
        Self {
            shared,
            guard,
            issued: false,
            done: false,
            retry_queue: VecDeque::new(),
        }
    }

    fn unwind(&mut self) {
        self.done = true;
        let (entries, bytes) = self.shared.stream.clear();
        self.guard.remove_buffered(bytes);
        for _ in 0..entries {
            self.shared.refs.release();
        }
        self.shared.stream.close();
    }
}

impl StateMachine for DefaultMetaRequest {
    fn next_request(&mut self) -> NextRequest {
        if let Some(request) = self.retry_queue.pop_front() {
            return NextRequest::Ready(request);
        }
        if !self.issued {
            self.issued = true;
            return NextRequest::Ready(Request::passthrough(self.shared.template.body.clone()));
        }
        if self.done {
            NextRequest::Finished
        } else {
            NextRequest::NotYet
        }
    }

    fn on_success(&mut self, _request: Request, response: HttpResponse) {
        if !response.body.is_empty() {
            self.shared.refs.acquire();
            self.guard.add_buffered(response.body.len() as u64);
            self.shared.stream.push(StreamedPart {
                part_index: 0,
                offset: 0,
                body: response.body,
            });
        }
        self.done = true;
        self.shared.stream.close();
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
        self.done && self.retry_queue.is_empty()
    }
}
