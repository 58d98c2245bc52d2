//! Request orchestration: validate, negotiate, then stream.
//!
//! A request moves through `validate -> negotiate -> (not modified | single
//! shot | stream)`. Everything up to and including the first upstream chunk
//! happens before the status is committed, so those failures still produce a
//! proper error response. After that the body is produced by a spawned pump
//! task and a failure can only tear the connection down.

use std::io;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, ETAG, RANGE, VARY};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::headers::{ContentLength, HeaderMapExt, IfNoneMatch};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    AuthError, AuthValidator, BufferedSink, ByteSink, ByteWindow, ChannelSink, ChunkPolicy,
    ChunkedReader, Disposition, FetchError, FileDescriptor, FileLookup, GzipSink, LimitSink,
    RangeError, Ranged, RangedResponse, RangedStream, ReadError, SessionPool, SinkError,
    StreamError,
};

pub const DEFAULT_READ_BUFFER: usize = 512 * 1024;
pub const DEFAULT_WRITE_BUFFER: usize = 512 * 1024;

// frames queued between the pump and the response body
const CHANNEL_DEPTH: usize = 4;

/// Query string of `/stream/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub hash: Option<String>,
    /// `d=true` asks for `Content-Disposition: attachment`.
    pub d: Option<String>,
}

impl StreamQuery {
    pub fn is_download(&self) -> bool {
        matches!(self.d.as_deref(), Some("true" | "1"))
    }
}

/// One stream request, detached from the HTTP extractors.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub method: Method,
    pub id: String,
    pub hash: Option<String>,
    pub download: bool,
    pub headers: HeaderMap,
}

impl StreamRequest {
    pub fn get(id: impl Into<String>, hash: Option<&str>) -> Self {
        StreamRequest {
            method: Method::GET,
            id: id.into(),
            hash: hash.map(str::to_string),
            download: false,
            headers: HeaderMap::new(),
        }
    }
}

/// Shared state of the streaming endpoint.
pub struct Gateway {
    lookup: Arc<dyn FileLookup>,
    pool: SessionPool,
    auth: AuthValidator,
    policy: ChunkPolicy,
    read_buffer: usize,
    write_buffer: usize,
    compression: bool,
}

impl Gateway {
    pub fn new(
        lookup: Arc<dyn FileLookup>,
        pool: SessionPool,
        auth: AuthValidator,
        policy: ChunkPolicy,
    ) -> Self {
        Gateway {
            lookup,
            pool,
            auth,
            policy,
            read_buffer: DEFAULT_READ_BUFFER,
            write_buffer: DEFAULT_WRITE_BUFFER,
            compression: false,
        }
    }

    /// `read` caps the frames taken from the reader, `write` is the output
    /// coalescing buffer.
    pub fn with_buffers(mut self, read: usize, write: usize) -> Self {
        self.read_buffer = read.max(1);
        self.write_buffer = write.max(1);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn auth(&self) -> &AuthValidator {
        &self.auth
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    #[tracing::instrument(name = "stream", skip_all, fields(id = %request.id, method = %request.method))]
    pub async fn respond(&self, request: StreamRequest) -> Result<Response, StreamError> {
        let id: i64 = request
            .id
            .parse()
            .map_err(|_| StreamError::BadRequest("invalid file id".to_string()))?;
        let hash = match request.hash.as_deref() {
            Some(hash) if !hash.is_empty() => hash,
            _ => return Err(AuthError::Missing.into()),
        };

        let file = self.lookup.lookup(id).await?;
        self.auth.verify(Some(hash), &file)?;

        let range = match request.headers.get(RANGE) {
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| RangeError::Malformed("non-ascii range".to_string()))?,
            ),
            None => None,
        };
        let disposition = if request.download { Disposition::Attachment } else { Disposition::Inline };
        let negotiated = Ranged::new(&file, range)
            .if_none_match(request.headers.typed_get::<IfNoneMatch>())
            .disposition(disposition)
            .try_respond(&self.policy)?;

        let status = negotiated.status();
        tracing::debug!(size = file.size, range, %status, "negotiated");

        match negotiated {
            RangedResponse::NotModified { headers } => {
                tracing::debug!("not modified");
                Ok((status, headers).into_response())
            }
            RangedResponse::SingleShot { headers } => {
                self.single_shot(&request.method, &file, headers).await
            }
            RangedResponse::Full { window, headers } | RangedResponse::Partial { window, headers } => {
                self.stream(&request, &file, status, window, headers).await
            }
        }
    }

    async fn single_shot(
        &self,
        method: &Method,
        file: &FileDescriptor,
        mut headers: HeaderMap,
    ) -> Result<Response, StreamError> {
        let limit = self.policy.chunk_size;
        let lease = self.pool.acquire().await?;
        let cancel = CancellationToken::new();
        let fetched = lease.session().fetch(&file.location, 0, limit, &cancel).await;
        drop(lease);

        let mut body = fetched.map_err(|source| match source {
            FetchError::Cancelled => ReadError::Cancelled,
            source => ReadError::Upstream { offset: 0, end: limit - 1, source },
        })?;
        body.truncate(limit as usize);

        headers.typed_insert(ContentLength(body.len() as u64));
        if *method == Method::HEAD {
            return Ok((StatusCode::OK, headers).into_response());
        }
        Ok((StatusCode::OK, headers, body).into_response())
    }

    async fn stream(
        &self,
        request: &StreamRequest,
        file: &FileDescriptor,
        status: StatusCode,
        window: ByteWindow,
        mut headers: HeaderMap,
    ) -> Result<Response, StreamError> {
        let mime = file.content_type();
        let negotiable = self.compression && status == StatusCode::OK && is_compressible(&mime);
        if negotiable {
            headers.insert(VARY, HeaderValue::from_static("accept-encoding"));
        }
        let compress = negotiable && accepts_gzip(&request.headers);
        if compress {
            headers.remove(CONTENT_LENGTH);
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            let etag = headers.get(ETAG).and_then(gzip_etag);
            if let Some(etag) = etag {
                headers.insert(ETAG, etag);
            }
        }

        if request.method == Method::HEAD {
            return Ok((status, headers).into_response());
        }

        let lease = self.pool.acquire().await?;
        let cancel = CancellationToken::new();
        let mut reader = ChunkedReader::new(
            lease,
            file.location.clone(),
            window,
            self.policy.chunk_size,
            cancel.clone(),
        );
        // a failure here can still become an error status
        let first = reader.read_chunk(self.read_buffer).await?.unwrap_or_default();

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let abort = tx.clone();
        let output = BufferedSink::new(ChannelSink::new(tx), self.write_buffer);
        let output: Box<dyn ByteSink> = if compress {
            Box::new(GzipSink::new(output))
        } else {
            Box::new(output)
        };
        let sink = LimitSink::new(output, window.len());

        let pump = Pump {
            reader,
            sink,
            abort,
            flush_each: mime.starts_with("video/"),
            read_size: self.read_buffer,
        };
        tokio::spawn(pump.run(first));

        let length = (!compress).then_some(window.len());
        let body = RangedStream::from_channel(rx, length).with_cancel_guard(cancel.drop_guard());
        Ok((status, headers, body).into_response())
    }
}

/// Copies the reader into the sink chain until the window is exhausted,
/// the limit is hit, or either side fails.
struct Pump {
    reader: ChunkedReader,
    sink: LimitSink<Box<dyn ByteSink>>,
    abort: mpsc::Sender<io::Result<Bytes>>,
    flush_each: bool,
    read_size: usize,
}

impl Pump {
    async fn run(mut self, first: Bytes) {
        let window = self.reader.window();
        let mut next = Some(first);

        loop {
            let chunk = match next.take() {
                Some(chunk) => chunk,
                None => match self.reader.read_chunk(self.read_size).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(err) => return self.fail(err, window).await,
                },
            };

            let written = match self.sink.write(chunk).await {
                Ok(()) if self.flush_each => self.sink.flush().await,
                written => written,
            };
            match written {
                Ok(()) => {}
                Err(SinkError::LimitReached) => {
                    tracing::debug!(%window, "content length reached");
                    break;
                }
                Err(SinkError::Closed) => {
                    tracing::debug!(%window, position = self.reader.position(), "client went away");
                    return;
                }
                Err(SinkError::Io(err)) => {
                    tracing::error!(%window, "output failed: {}", err);
                    let _ = self.abort.send(Err(err)).await;
                    return;
                }
            }
        }

        if let Err(err) = self.sink.close().await {
            tracing::debug!(%window, "closing output: {}", err);
        }
        tracing::debug!(%window, "stream complete");
    }

    async fn fail(mut self, err: ReadError, window: ByteWindow) {
        match &err {
            ReadError::Cancelled => {
                tracing::debug!(%window, "stream cancelled");
                return;
            }
            ReadError::Shortfall { offset, .. } => {
                tracing::warn!(%window, offset, "upstream ended before the window, response is short");
                // the body ends early; hyper drops the connection on the length mismatch
                let _ = self.sink.close().await;
                return;
            }
            err => tracing::error!(%window, position = self.reader.position(), "upstream failure: {}", err),
        }

        let _ = self.sink.flush().await;
        let _ = self.abort.send(Err(err.into())).await;
    }
}

fn is_compressible(mime: &str) -> bool {
    !["video/", "audio/", "image/"].iter().any(|prefix| mime.starts_with(prefix))
}

/// An explicit `gzip` entry decides; otherwise `*` does. Any `q=0` on
/// `gzip` refuses it.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut gzip = None;
    let mut wildcard = None;

    let codings = headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','));
    for coding in codings {
        let mut params = coding.split(';').map(str::trim);
        let name = params.next().unwrap_or_default();
        let accepted = !params.any(|param| {
            param
                .strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q == 0.0)
        });
        if name.eq_ignore_ascii_case("gzip") {
            gzip = Some(gzip.unwrap_or(true) && accepted);
        } else if name == "*" {
            wildcard = Some(accepted);
        }
    }

    gzip.or(wildcard).unwrap_or(false)
}

/// Entity tag of the gzip variant: `"tag"` becomes `"tag-gz"`.
fn gzip_etag(etag: &HeaderValue) -> Option<HeaderValue> {
    let tag = etag.to_str().ok()?.strip_suffix('"')?;
    HeaderValue::from_str(&format!("{tag}-gz\"")).ok()
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    capacity: usize,
    available: usize,
}

async fn stream_file(
    State(gateway): State<Arc<Gateway>>,
    method: Method,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let request = StreamRequest {
        method,
        id,
        download: query.is_download(),
        hash: query.hash,
        headers,
    };
    match gateway.respond(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Health> {
    let pool = gateway.pool();
    Json(Health {
        status: if pool.is_closed() { "closing" } else { "ok" },
        capacity: pool.capacity(),
        available: pool.available(),
    })
}

/// `GET`/`HEAD /stream/{id}?hash=..&d=..` and `GET /healthz`.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/stream/{id}", get(stream_file))
        .route("/healthz", get(health))
        .with_state(gateway)
}
