//! Multipart PUT: upload an object as CreateMultipartUpload → UploadPart×N
//! → CompleteMultipartUpload
//!
//! Part count is fixed up front from the template body length. ETags are
//! collected per part, quotes and all, and replayed in ascending
//! 1-indexed order in the Complete body. Any permanent failure or a user
//! cancel after the upload id exists triggers a best-effort
//! AbortMultipartUpload before the error surfaces; abort failures are
//! logged, never reported.

use super::{MetaShared, NextRequest, StateMachine};
use crate::error::ClientError;
use crate::net::HttpResponse;
use crate::request::{Request, RequestKind};
use crate::xml;
use bytes::Bytes;
use http::header::ETAG;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutState {
    Create { issued: bool },
    Upload,
    Complete { issued: bool },
    Abort { issued: bool },
    Done,
}

pub(crate) struct MultipartPutMetaRequest {
    shared: Arc<MetaShared>,
    state: PutState,
    retry_queue: VecDeque<Request>,
    num_parts: u32,
    next_part: u32,
    etags: Vec<Option<String>>,
    etags_recorded: u32,
}

impl MultipartPutMetaRequest {
    pub(crate) fn new(shared: Arc<MetaShared>) -> Self {
        let object_len = shared.template.body.len() as u64;
        let num_parts = object_len.div_ceil(shared.part_size) as u32;
        Self {
            shared,
            state: PutState::Create { issued: false },
            retry_queue: VecDeque::new(),
            num_parts,
            next_part: 0,
            etags: vec![None; num_parts as usize],
            etags_recorded: 0,
        }
    }

    fn part_body(&self, part_index: u32) -> Bytes {
        let start = (u64::from(part_index) * self.shared.part_size) as usize;
        let end = (start + self.shared.part_size as usize).min(self.shared.template.body.len());
        self.shared.template.body.slice(start..end)
    }

    fn completed_parts(&self) -> Vec<xml::CompletedPart> {
        self.etags
            .iter()
            .enumerate()
            .filter_map(|(index, etag)| {
                etag.as_ref().map(|etag| xml::CompletedPart {
                    part_number: index as u32 + 1,
                    etag: etag.clone(),
                })
            })
            .collect()
    }

    /// Move to the failure exit: abort when an upload exists to abort,
    /// otherwise straight to done. The sticky error is already recorded.
    fn enter_failure(&mut self) {
        if matches!(self.state, PutState::Abort { .. } | PutState::Done) {
            return;
        }
        if self.shared.upload_id().is_some() {
            self.state = PutState::Abort { issued: false };
        } else {
            self.state = PutState::Done;
        }
    }
}

impl StateMachine for MultipartPutMetaRequest {
    fn next_request(&mut self) -> NextRequest {
        if let Some(request) = self.retry_queue.pop_front() {
            return NextRequest::Ready(request);
        }

        match self.state {
            PutState::Create { issued: false } => {
                self.state = PutState::Create { issued: true };
                NextRequest::Ready(Request::create_multipart_upload())
            }
            PutState::Create { issued: true } => NextRequest::NotYet,
            PutState::Upload => {
                if self.next_part < self.num_parts && self.shared.window_open() {
                    let index = self.next_part;
                    self.next_part += 1;
                    NextRequest::Ready(Request::upload_part(index, self.part_body(index)))
                } else {
                    NextRequest::NotYet
                }
            }
            PutState::Complete { issued: false } => {
                match xml::complete_multipart_upload_body(&self.completed_parts()) {
                    Ok(body) => {
                        self.state = PutState::Complete { issued: true };
                        NextRequest::Ready(Request::complete_multipart_upload(Bytes::from(body)))
                    }
                    Err(error) => {
                        self.shared.set_error(error);
                        self.enter_failure();
                        NextRequest::NotYet
                    }
                }
            }
            PutState::Complete { issued: true } => NextRequest::NotYet,
            PutState::Abort { issued: false } => {
                self.state = PutState::Abort { issued: true };
                NextRequest::Ready(Request::abort_multipart_upload())
            }
            PutState::Abort { issued: true } => NextRequest::NotYet,
            PutState::Done => NextRequest::Finished,
        }
    }

    fn on_success(&mut self, request: Request, response: HttpResponse) {
        match request.kind {
            RequestKind::CreateMultipartUpload => {
                let upload_id = xml::top_level_tag_value(&response.body_str(), "UploadId");
                match upload_id {
                    Ok(Some(id)) if !id.is_empty() => {
                        tracing::debug!(meta_request = self.shared.id, upload_id = %id, "multipart upload created");
                        self.shared.set_upload_id(id);
                        self.state = PutState::Upload;
                    }
                    _ => {
                        self.shared.set_error(ClientError::XmlParse(
                            "CreateMultipartUpload response missing UploadId".to_string(),
                        ));
                        self.enter_failure();
                    }
                }
            }
            RequestKind::UploadPart => {
                let etag = response.header_str(ETAG.as_str()).map(str::to_string);
                let Some(etag) = etag else {
                    self.shared.set_error(ClientError::Internal(
                        "UploadPart response missing ETag".to_string(),
                    ));
                    self.enter_failure();
                    return;
                };
                let slot = &mut self.etags[request.part_index as usize];
                if slot.is_none() {
                    self.etags_recorded += 1;
                }
                *slot = Some(etag);
                if self.etags_recorded == self.num_parts {
                    self.state = PutState::Complete { issued: false };
                }
            }
            RequestKind::CompleteMultipartUpload => {
                // S3 can answer Complete with 200 and an <Error> body.
                if let Some(code) = xml::root_error_code(&response.body_str()) {
                    self.shared.set_error(ClientError::HttpStatus {
                        status: response.status.as_u16(),
                        code: Some(code),
                    });
                    self.enter_failure();
                } else {
                    self.state = PutState::Done;
                }
            }
            RequestKind::AbortMultipartUpload => {
                self.state = PutState::Done;
            }
            other => {
                tracing::debug!(meta_request = self.shared.id, kind = ?other, "unexpected completion");
            }
        }
    }

    fn on_fatal(&mut self, request: Request) {
        if request.kind == RequestKind::AbortMultipartUpload {
            // Best effort only; the sticky error stays whatever failed first.
            tracing::warn!(
                meta_request = self.shared.id,
                "AbortMultipartUpload failed; upload may be left for lifecycle cleanup"
            );
            self.state = PutState::Done;
            return;
        }
        self.enter_failure();
    }

    fn requeue(&mut self, request: Request) {
        self.retry_queue.push_back(request);
    }

    fn on_cancel(&mut self) {
        self.enter_failure();
    }

    fn is_finished(&self) -> bool {
        self.state == PutState::Done && self.retry_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_request::MetaRequestKind;
    use crate::request::MessageTemplate;
    use crate::signing::{CachedSigningConfig, Credentials, SigningConfig, StaticCredentialsProvider};
    use http::header::HeaderValue;
    use http::{HeaderMap, StatusCode};

    const MIB: usize = 1024 * 1024;

    fn machine_with_body(len: usize, part_size: u64) -> MultipartPutMetaRequest {
        let provider = Arc::new(StaticCredentialsProvider::new(Credentials::new("ak", "sk")));
        let signing = Arc::new(CachedSigningConfig::new(&SigningConfig::default_for(
            "us-east-1",
            provider,
        )));
        let shared = MetaShared::new(
            3,
            MetaRequestKind::PutObject,
            MessageTemplate::put("/obj", Bytes::from(vec![7u8; len])),
            signing,
            part_size,
            16,
            None,
            None,
        );
        MultipartPutMetaRequest::new(shared)
    }

    fn ready(machine: &mut MultipartPutMetaRequest) -> Request {
        match machine.next_request() {
            NextRequest::Ready(r) => r,
            NextRequest::NotYet => panic!("expected ready, got not-yet"),
            NextRequest::Finished => panic!("expected ready, got finished"),
        }
    }

    fn create_response(upload_id: &str) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(format!(
                "<InitiateMultipartUploadResult><UploadId>{upload_id}</UploadId></InitiateMultipartUploadResult>"
            )),
        }
    }

    fn part_response(etag: &str) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_str(etag).unwrap());
        HttpResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::new(),
        }
    }

    fn ok_response() -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_create_upload_complete_flow() {
        // 40 MiB at 16 MiB parts: 16/16/8.
        let mut machine = machine_with_body(40 * MIB, 16 * MIB as u64);
        assert_eq!(machine.num_parts, 3);

        let create = ready(&mut machine);
        assert_eq!(create.kind, RequestKind::CreateMultipartUpload);
        assert!(matches!(machine.next_request(), NextRequest::NotYet));
        machine.on_success(create, create_response("upload-1"));
        assert_eq!(machine.shared.upload_id().as_deref(), Some("upload-1"));

        let parts: Vec<Request> = (0..3).map(|_| ready(&mut machine)).collect();
        assert_eq!(parts[0].body.len(), 16 * MIB);
        assert_eq!(parts[1].body.len(), 16 * MIB);
        assert_eq!(parts[2].body.len(), 8 * MIB);
        assert!(matches!(machine.next_request(), NextRequest::NotYet));

        for (i, part) in parts.into_iter().enumerate() {
            machine.on_success(part, part_response(&format!("\"etag-{i}\"")));
        }

        let complete = ready(&mut machine);
        assert_eq!(complete.kind, RequestKind::CompleteMultipartUpload);
        let body = String::from_utf8(complete.body.to_vec()).unwrap();
        assert_eq!(body.matches("<Part>").count(), 3);
        let first = body.find("<PartNumber>1</PartNumber>").unwrap();
        let second = body.find("<PartNumber>2</PartNumber>").unwrap();
        let third = body.find("<PartNumber>3</PartNumber>").unwrap();
        assert!(first < second && second < third, "parts out of order: {body}");
        for i in 0..3 {
            assert!(body.contains(&format!("etag-{i}")), "missing etag-{i}: {body}");
        }

        machine.on_success(complete, ok_response());
        assert!(machine.is_finished());
        assert!(!machine.shared.has_error());
    }

    #[test]
    fn test_out_of_order_etag_collection() {
        let mut machine = machine_with_body(40 * MIB, 16 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(create, create_response("u"));

        let mut parts: Vec<Request> = (0..3).map(|_| ready(&mut machine)).collect();
        // Complete the last part first.
        let last = parts.pop().unwrap();
        machine.on_success(last, part_response("etag-c"));
        machine.on_success(parts.remove(0), part_response("etag-a"));
        machine.on_success(parts.remove(0), part_response("etag-b"));

        let complete = ready(&mut machine);
        let body = String::from_utf8(complete.body.to_vec()).unwrap();
        let a = body.find("etag-a").unwrap();
        let b = body.find("etag-b").unwrap();
        let c = body.find("etag-c").unwrap();
        assert!(a < b && b < c, "parts must be ascending: {body}");
    }

    #[test]
    fn test_create_without_upload_id_fails_without_abort() {
        let mut machine = machine_with_body(MIB * 6, 5 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(
            create,
            HttpResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"<InitiateMultipartUploadResult></InitiateMultipartUploadResult>"),
            },
        );

        // No upload id: the failure exit must not try to abort.
        assert!(machine.is_finished());
        assert!(machine.shared.has_error());
    }

    #[test]
    fn test_fatal_create_goes_straight_to_done() {
        let mut machine = machine_with_body(MIB * 6, 5 * MIB as u64);
        let create = ready(&mut machine);
        machine.shared.set_error(ClientError::HttpStatus {
            status: 403,
            code: None,
        });
        machine.on_fatal(create);
        assert!(machine.is_finished());
    }

    #[test]
    fn test_fatal_part_aborts_upload() {
        let mut machine = machine_with_body(40 * MIB, 16 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(create, create_response("u2"));

        let part = ready(&mut machine);
        machine.shared.set_error(ClientError::HttpStatus {
            status: 400,
            code: None,
        });
        machine.on_fatal(part);

        let abort = ready(&mut machine);
        assert_eq!(abort.kind, RequestKind::AbortMultipartUpload);
        assert!(!machine.is_finished());

        machine.on_success(abort, ok_response());
        assert!(machine.is_finished());
    }

    #[test]
    fn test_abort_failure_still_finishes() {
        let mut machine = machine_with_body(40 * MIB, 16 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(create, create_response("u3"));
        machine.shared.set_error(ClientError::Cancelled);
        machine.on_cancel();

        let abort = ready(&mut machine);
        machine.on_fatal(abort);
        assert!(machine.is_finished());
        // The sticky error is still the cancel, not the abort failure.
        assert!(matches!(
            machine.shared.build_result().error,
            Some(ClientError::Cancelled)
        ));
    }

    #[test]
    fn test_missing_etag_is_fatal() {
        let mut machine = machine_with_body(MIB * 6, 5 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(create, create_response("u4"));

        let part = ready(&mut machine);
        machine.on_success(part, ok_response()); // no ETag header

        assert!(machine.shared.has_error());
        let abort = ready(&mut machine);
        assert_eq!(abort.kind, RequestKind::AbortMultipartUpload);
    }

    #[test]
    fn test_complete_with_error_body_aborts() {
        let mut machine = machine_with_body(MIB * 5, 5 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(create, create_response("u5"));
        let part = ready(&mut machine);
        machine.on_success(part, part_response("\"e\""));

        let complete = ready(&mut machine);
        machine.on_success(
            complete,
            HttpResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"<Error><Code>InternalError</Code></Error>"),
            },
        );

        assert!(machine.shared.has_error());
        let abort = ready(&mut machine);
        assert_eq!(abort.kind, RequestKind::AbortMultipartUpload);
    }

    #[test]
    fn test_retried_part_is_reissued_first() {
        let mut machine = machine_with_body(40 * MIB, 16 * MIB as u64);
        let create = ready(&mut machine);
        machine.on_success(create, create_response("u6"));

        let part = ready(&mut machine);
        let index = part.part_index;
        machine.requeue(part);

        let reissued = ready(&mut machine);
        assert_eq!(reissued.part_index, index);
        assert_eq!(reissued.kind, RequestKind::UploadPart);
    }
}
