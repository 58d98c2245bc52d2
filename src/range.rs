//! `Range` negotiation.
//!
//! Turns a [`FileDescriptor`] plus the request's `Range` and `If-None-Match`
//! headers into the window that will actually be served, a status and the
//! complete response header set. Nothing here touches the upstream.
//!
//! Served windows are never floored to a chunk boundary: a request for
//! `bytes=S-E` is answered with `[S, min(E, size - 1, S + max_window - 1)]`
//! and `Content-Range` reports exactly that.

use std::time::Duration;

use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{
    AcceptRanges, ContentLength, ContentRange, ETag, HeaderMap, HeaderMapExt, HeaderValue,
    IfNoneMatch,
};
use axum_extra::TypedHeader;

use crate::{ByteWindow, FileDescriptor};

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_PRELOAD_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Chunking and caching constants shared by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Bytes requested from the upstream per fetch.
    pub chunk_size: u64,
    /// Upper bound on the length of a window served for a `Range` request.
    pub preload_size: u64,
    pub cache_max_age: Duration,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        ChunkPolicy {
            chunk_size: DEFAULT_CHUNK_SIZE,
            preload_size: DEFAULT_PRELOAD_SIZE,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
        }
    }
}

impl ChunkPolicy {
    /// Longest window a single range response may cover.
    pub fn max_window(&self) -> u64 {
        self.chunk_size.max(self.preload_size).max(1)
    }

    fn cache_control(&self) -> HeaderValue {
        let value = format!("public, max-age={}, immutable", self.cache_max_age.as_secs());
        HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("public"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Inline,
    Attachment,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("malformed range: {0}")]
    Malformed(String),

    #[error("multiple ranges are not supported")]
    Multipart,

    #[error("range not satisfiable for {size} bytes")]
    NotSatisfiable { size: u64 },
}

impl IntoResponse for RangeError {
    fn into_response(self) -> Response {
        match self {
            RangeError::Malformed(_) => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
            RangeError::Multipart => {
                (StatusCode::RANGE_NOT_SATISFIABLE, self.to_string()).into_response()
            }
            RangeError::NotSatisfiable { size } => {
                let header = TypedHeader(ContentRange::unsatisfied_bytes(size));
                (StatusCode::RANGE_NOT_SATISFIABLE, header, self.to_string()).into_response()
            }
        }
    }
}

/// Negotiated outcome: what to send and, for streamable files, which bytes.
#[derive(Debug)]
pub enum RangedResponse {
    /// Zero-size sentinel: fetch the whole object once, no range headers.
    SingleShot { headers: HeaderMap },
    /// `If-None-Match` matched, answer `304` with no body.
    NotModified { headers: HeaderMap },
    /// No `Range` header, the whole file.
    Full { window: ByteWindow, headers: HeaderMap },
    /// A single range, possibly narrower than requested.
    Partial { window: ByteWindow, headers: HeaderMap },
}

impl RangedResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            RangedResponse::SingleShot { .. } | RangedResponse::Full { .. } => StatusCode::OK,
            RangedResponse::NotModified { .. } => StatusCode::NOT_MODIFIED,
            RangedResponse::Partial { .. } => StatusCode::PARTIAL_CONTENT,
        }
    }

    pub fn window(&self) -> Option<ByteWindow> {
        match self {
            RangedResponse::Full { window, .. } | RangedResponse::Partial { window, .. } => {
                Some(*window)
            }
            _ => None,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            RangedResponse::SingleShot { headers }
            | RangedResponse::NotModified { headers }
            | RangedResponse::Full { headers, .. }
            | RangedResponse::Partial { headers, .. } => headers,
        }
    }
}

/// Inputs of one negotiation. Call [`Ranged::try_respond`] to evaluate.
#[derive(Debug, Clone)]
pub struct Ranged<'a> {
    file: &'a FileDescriptor,
    range: Option<&'a str>,
    if_none_match: Option<IfNoneMatch>,
    disposition: Disposition,
}

impl<'a> Ranged<'a> {
    /// `range` is the raw `Range` header value, if the request carried one.
    pub fn new(file: &'a FileDescriptor, range: Option<&'a str>) -> Self {
        Ranged { file, range, if_none_match: None, disposition: Disposition::Inline }
    }

    pub fn if_none_match(mut self, if_none_match: Option<IfNoneMatch>) -> Self {
        self.if_none_match = if_none_match;
        self
    }

    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn try_respond(self, policy: &ChunkPolicy) -> Result<RangedResponse, RangeError> {
        let file = self.file;
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, policy.cache_control());

        if file.is_single_shot() {
            headers.insert(CONTENT_TYPE, content_type(file));
            headers.insert(CONTENT_DISPOSITION, content_disposition(self.disposition, &file.name));
            return Ok(RangedResponse::SingleShot { headers });
        }

        let etag = etag_for(file);
        if let Some(etag) = &etag {
            headers.typed_insert(etag.clone());
            let matched = self
                .if_none_match
                .as_ref()
                .is_some_and(|condition| !condition.precondition_passes(etag));
            if matched {
                return Ok(RangedResponse::NotModified { headers });
            }
        }

        headers.typed_insert(AcceptRanges::bytes());
        headers.insert(CONTENT_TYPE, content_type(file));
        headers.insert(CONTENT_DISPOSITION, content_disposition(self.disposition, &file.name));

        match self.range {
            None => {
                let window = ByteWindow::new(0, file.size - 1);
                headers.typed_insert(ContentLength(window.len()));
                Ok(RangedResponse::Full { window, headers })
            }
            Some(range) => {
                let requested = parse_range_header(range, file.size)?;
                let window = requested.bounded(policy.max_window());
                let content_range = ContentRange::bytes(window.start..=window.end, file.size)
                    .map_err(|_| RangeError::NotSatisfiable { size: file.size })?;
                headers.typed_insert(content_range);
                headers.typed_insert(ContentLength(window.len()));
                Ok(RangedResponse::Partial { window, headers })
            }
        }
    }
}

/// Strong validator derived from the file's identity.
pub fn etag_for(file: &FileDescriptor) -> Option<ETag> {
    format!("\"{:x}-{:x}\"", file.id, file.size).parse().ok()
}

/// Parses a single-range `Range` header into the requested window, with the
/// end clamped to the last byte of a file of `size` bytes.
///
/// Accepts `bytes=S-E`, `bytes=S-` and the suffix form `bytes=-N`.
pub fn parse_range_header(header: &str, size: u64) -> Result<ByteWindow, RangeError> {
    let malformed = || RangeError::Malformed(header.to_string());

    let (unit, set) = header.trim().split_once('=').ok_or_else(malformed)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(malformed());
    }

    let mut specs = set.split(',').map(str::trim).filter(|spec| !spec.is_empty());
    let spec = specs.next().ok_or_else(malformed)?;
    if specs.next().is_some() {
        return Err(RangeError::Multipart);
    }

    let (first, last) = spec.split_once('-').ok_or_else(malformed)?;
    let unsatisfiable = RangeError::NotSatisfiable { size };
    let Some(last_byte) = size.checked_sub(1) else {
        return Err(unsatisfiable);
    };

    match (first.trim(), last.trim()) {
        ("", "") => Err(malformed()),
        ("", suffix) => {
            let suffix = parse_position(suffix).ok_or_else(malformed)?;
            if suffix == 0 {
                return Err(unsatisfiable);
            }
            Ok(ByteWindow::new(size.saturating_sub(suffix), last_byte))
        }
        (start, end) => {
            let start = parse_position(start).ok_or_else(malformed)?;
            let end = match end {
                "" => last_byte,
                end => parse_position(end).ok_or_else(malformed)?,
            };
            if start > end || start > last_byte {
                return Err(unsatisfiable);
            }
            Ok(ByteWindow::new(start, end.min(last_byte)))
        }
    }
}

fn parse_position(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn content_type(file: &FileDescriptor) -> HeaderValue {
    HeaderValue::from_str(&file.content_type())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

fn content_disposition(disposition: Disposition, name: &str) -> HeaderValue {
    let kind = disposition.as_str();
    if name.is_empty() {
        return HeaderValue::from_static(kind);
    }

    let fallback: String = name
        .chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect();
    let mut value = format!("{kind}; filename=\"{fallback}\"");
    if fallback != name {
        value.push_str("; filename*=UTF-8''");
        value.push_str(&urlencoding::encode(name));
    }
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(kind))
}
