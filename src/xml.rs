//! The small slice of XML the S3 wire protocol requires
//!
//! Three shapes matter: `<InitiateMultipartUploadResult><UploadId>` from
//! CreateMultipartUpload, `<Error><Code>` from failed requests, and the
//! `<CompleteMultipartUpload>` request body. Tag-value extraction matches
//! only immediate children of the document root — a nested element with the
//! same name must not satisfy a lookup, which is consistent with the S3
//! response schemas.

use crate::error::{ClientError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

/// Extract the text of a tag that is an immediate child of the document
/// root. Returns `Ok(None)` when the tag is absent at that depth.
pub(crate) fn top_level_tag_value(doc: &str, tag: &str) -> Result<Option<String>> {
    scan(doc, tag, None)
}

/// Extract `<Code>` from an `<Error>` document. Returns `None` when the
/// document is not an error response or is unparseable — callers use this
/// opportunistically on failed responses.
pub(crate) fn root_error_code(doc: &str) -> Option<String> {
    scan(doc, "Code", Some("Error")).ok().flatten()
}

fn scan(doc: &str, tag: &str, require_root: Option<&str>) -> Result<Option<String>> {
    let mut reader = Reader::from_str(doc);
    let mut depth = 0usize;
    let mut capturing = false;
    let mut value = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 1 {
                    if let Some(root) = require_root {
                        if e.name().as_ref() != root.as_bytes() {
                            return Ok(None);
                        }
                    }
                } else if depth == 2 && e.name().as_ref() == tag.as_bytes() {
                    capturing = true;
                    value.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 && e.name().as_ref() == tag.as_bytes() {
                    return Ok(Some(String::new()));
                }
            }
            Ok(Event::Text(e)) if capturing => {
                let text = e
                    .unescape()
                    .map_err(|err| ClientError::XmlParse(err.to_string()))?;
                value.push_str(&text);
            }
            Ok(Event::CData(e)) if capturing => {
                value.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::End(e)) => {
                if capturing && depth == 2 && e.name().as_ref() == tag.as_bytes() {
                    return Ok(Some(value));
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(ClientError::XmlParse(e.to_string())),
            Ok(_) => {}
        }
    }
}

/// One part of a completed multipart upload
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CompletedPart {
    /// 1-indexed part number
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    /// ETag as returned by UploadPart, quotes included
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    part: &'a [CompletedPart],
}

/// Serialize the CompleteMultipartUpload request body. Parts must already
/// be in ascending part-number order.
pub(crate) fn complete_multipart_upload_body(parts: &[CompletedPart]) -> Result<String> {
    quick_xml::se::to_string(&CompleteMultipartUpload { part: parts })
        .map_err(|e| ClientError::Internal(format!("serialize complete body: {e}")))
}
