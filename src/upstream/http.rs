//! Origin server reached over HTTP.
//!
//! `GET {base}/files/{id}` answers with a JSON [`FileDescriptor`]. The
//! descriptor's location is either an absolute URL or a path under `base`,
//! and is fetched with a single-range `Range` request per chunk.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::RANGE;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::{FetchError, FileDescriptor, FileLookup, Location, LookupError, Session};

#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: Client,
    base: Arc<str>,
}

impl HttpOrigin {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Ok(HttpOrigin { client: Client::builder().build()?, base: trim_base(base_url) })
    }

    /// One session per credential, or `pool_size` anonymous sessions when
    /// `tokens` is empty. Every session gets its own HTTP client so no two
    /// share a connection or an identity.
    pub fn sessions(
        &self,
        tokens: &[String],
        pool_size: usize,
    ) -> Result<Vec<Arc<dyn Session>>, reqwest::Error> {
        let tokens: Vec<Option<String>> = if tokens.is_empty() {
            vec![None; pool_size.max(1)]
        } else {
            tokens.iter().cloned().map(Some).collect()
        };

        tokens
            .into_iter()
            .map(|token| {
                let session = HttpSession {
                    client: Client::builder().build()?,
                    base: Arc::clone(&self.base),
                    token,
                };
                Ok(Arc::new(session) as Arc<dyn Session>)
            })
            .collect()
    }
}

#[async_trait]
impl FileLookup for HttpOrigin {
    async fn lookup(&self, id: i64) -> Result<FileDescriptor, LookupError> {
        let url = format!("{}/files/{id}", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LookupError::Failed(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(LookupError::NotFound(id)),
            status if status.is_success() => response
                .json::<FileDescriptor>()
                .await
                .map_err(|e| LookupError::Failed(format!("decoding descriptor {id}: {e}"))),
            status => Err(LookupError::Failed(format!("origin returned {status} for file {id}"))),
        }
    }
}

pub struct HttpSession {
    client: Client,
    base: Arc<str>,
    token: Option<String>,
}

impl HttpSession {
    fn url(&self, location: &Location) -> String {
        let location = location.as_str();
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}/{}", self.base, location.trim_start_matches('/'))
        }
    }

    async fn fetch_range(&self, location: &Location, offset: u64, limit: u64) -> Result<Bytes, FetchError> {
        let mut request = self
            .client
            .get(self.url(location))
            .header(RANGE, format!("bytes={}-{}", offset, offset + limit - 1));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => response.bytes().await.map_err(transport),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            // origin ignored the range, usable only from the first byte
            StatusCode::OK if offset == 0 => read_prefix(response, limit).await,
            StatusCode::OK => Err(FetchError::Unexpected(format!(
                "origin ignored range at offset {offset}"
            ))),
            status => Err(FetchError::Status { status: status.as_u16() }),
        }
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn fetch(
        &self,
        location: &Location,
        offset: u64,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FetchError> {
        if limit == 0 {
            return Ok(Bytes::new());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            fetched = self.fetch_range(location, offset, limit) => fetched,
        }
    }
}

/// Reads at most `limit` bytes of a body and drops the rest of the response.
async fn read_prefix(response: reqwest::Response, limit: u64) -> Result<Bytes, FetchError> {
    let limit = limit as usize;
    let mut body = std::pin::pin!(response.bytes_stream());
    let mut prefix = BytesMut::with_capacity(limit.min(64 * 1024));
    while prefix.len() < limit {
        let Some(frame) = body.next().await else {
            break;
        };
        let frame = frame.map_err(transport)?;
        let take = frame.len().min(limit - prefix.len());
        prefix.extend_from_slice(&frame[..take]);
    }
    Ok(prefix.freeze())
}

fn trim_base(base_url: &str) -> Arc<str> {
    Arc::from(base_url.trim_end_matches('/'))
}

fn transport(err: reqwest::Error) -> FetchError {
    FetchError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use axum::extract::{Path, State};
    use axum::http::header::AUTHORIZATION;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    use super::*;
    use crate::parse_range_header;

    const CONTENT: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    #[derive(Clone, Default)]
    struct Origin {
        authorizations: Arc<Mutex<Vec<String>>>,
    }

    async fn descriptor(Path(id): Path<i64>) -> Response {
        if id != 1 {
            return StatusCode::NOT_FOUND.into_response();
        }
        Json(FileDescriptor {
            id,
            name: "digits.txt".to_string(),
            size: CONTENT.len() as u64,
            mime_type: "text/plain".to_string(),
            location: Location::new("blobs/1"),
        })
        .into_response()
    }

    async fn blob(State(origin): State<Origin>, headers: HeaderMap) -> Response {
        if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            origin.authorizations.lock().unwrap().push(auth.to_string());
        }
        let Some(range) = headers.get(RANGE).and_then(|v| v.to_str().ok()) else {
            return CONTENT.into_response();
        };
        match parse_range_header(range, CONTENT.len() as u64) {
            Ok(window) => {
                let body = Bytes::from_static(CONTENT).slice(window.start as usize..=window.end as usize);
                (StatusCode::PARTIAL_CONTENT, body).into_response()
            }
            Err(e) => e.into_response(),
        }
    }

    async fn ignores_range() -> &'static [u8] {
        CONTENT
    }

    // sends the content, then keeps the body open without finishing it
    async fn unterminated() -> Response {
        let head = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(CONTENT)) });
        axum::body::Body::from_stream(head.chain(futures::stream::pending())).into_response()
    }

    async fn slow() -> &'static [u8] {
        tokio::time::sleep(Duration::from_secs(30)).await;
        CONTENT
    }

    async fn spawn_origin() -> (String, Origin) {
        let origin = Origin::default();
        let app = Router::new()
            .route("/files/{id}", get(descriptor))
            .route("/blobs/1", get(blob))
            .route("/plain", get(ignores_range))
            .route("/slow", get(slow))
            .route("/unterminated", get(unterminated))
            .with_state(origin.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/"), origin)
    }

    #[tokio::test]
    async fn test_lookup() {
        let (base, _) = spawn_origin().await;
        let origin = HttpOrigin::new(&base).unwrap();

        let file = origin.lookup(1).await.unwrap();
        assert_eq!("digits.txt", file.name);
        assert_eq!(36, file.size);
        assert_matches!(origin.lookup(2).await, Err(LookupError::NotFound(2)));
    }

    #[tokio::test]
    async fn test_lookup_unreachable() {
        let origin = HttpOrigin::new("http://127.0.0.1:1").unwrap();
        assert_matches!(origin.lookup(1).await, Err(LookupError::Failed(_)));
    }

    #[tokio::test]
    async fn test_fetch_range_with_credentials() {
        let (base, state) = spawn_origin().await;
        let origin = HttpOrigin::new(&base).unwrap();
        let sessions = origin.sessions(&["alpha".to_string(), "beta".to_string()], 8).unwrap();
        assert_eq!(2, sessions.len());

        let cancel = CancellationToken::new();
        let location = Location::new("/blobs/1");
        let chunk = sessions[0].fetch(&location, 10, 5, &cancel).await.unwrap();
        assert_eq!(Bytes::from_static(b"ABCDE"), chunk);
        let chunk = sessions[1].fetch(&location, 30, 10, &cancel).await.unwrap();
        assert_eq!(Bytes::from_static(b"UVWXYZ"), chunk);

        assert_eq!(
            vec!["Bearer alpha".to_string(), "Bearer beta".to_string()],
            *state.authorizations.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn test_anonymous_sessions() {
        let (base, state) = spawn_origin().await;
        let sessions = HttpOrigin::new(&base).unwrap().sessions(&[], 3).unwrap();
        assert_eq!(3, sessions.len());

        let chunk = sessions[2]
            .fetch(&Location::new("blobs/1"), 0, 4, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(Bytes::from_static(b"0123"), chunk);
        assert!(state.authorizations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_past_end_is_empty() {
        let (base, _) = spawn_origin().await;
        let sessions = HttpOrigin::new(&base).unwrap().sessions(&[], 1).unwrap();
        let chunk = sessions[0]
            .fetch(&Location::new("blobs/1"), 36, 4, &CancellationToken::new())
            .await
            .unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn test_origin_ignoring_range() {
        let (base, _) = spawn_origin().await;
        let sessions = HttpOrigin::new(&base).unwrap().sessions(&[], 1).unwrap();
        let cancel = CancellationToken::new();
        let location = Location::new("plain");

        let chunk = sessions[0].fetch(&location, 0, 4, &cancel).await.unwrap();
        assert_eq!(Bytes::from_static(b"0123"), chunk);
        assert_matches!(
            sessions[0].fetch(&location, 4, 4, &cancel).await,
            Err(FetchError::Unexpected(_))
        );
    }

    #[tokio::test]
    async fn test_origin_ignoring_range_reads_only_limit() {
        let (base, _) = spawn_origin().await;
        let sessions = HttpOrigin::new(&base).unwrap().sessions(&[], 1).unwrap();
        let location = Location::new("unterminated");
        let cancel = CancellationToken::new();
        let fetch = sessions[0].fetch(&location, 0, 4, &cancel);

        let chunk = tokio::time::timeout(Duration::from_secs(5), fetch).await.unwrap().unwrap();
        assert_eq!(Bytes::from_static(b"0123"), chunk);
    }

    #[tokio::test]
    async fn test_missing_blob_status() {
        let (base, _) = spawn_origin().await;
        let sessions = HttpOrigin::new(&base).unwrap().sessions(&[], 1).unwrap();
        assert_matches!(
            sessions[0].fetch(&Location::new("nope"), 0, 4, &CancellationToken::new()).await,
            Err(FetchError::Status { status: 404 })
        );
    }

    #[tokio::test]
    async fn test_cancel_slow_fetch() {
        let (base, _) = spawn_origin().await;
        let sessions = HttpOrigin::new(&base).unwrap().sessions(&[], 1).unwrap();
        let cancel = CancellationToken::new();

        let fetch = tokio::spawn({
            let session = Arc::clone(&sessions[0]);
            let cancel = cancel.clone();
            async move { session.fetch(&Location::new("slow"), 0, 4, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), fetch).await.unwrap().unwrap();
        assert_matches!(result, Err(FetchError::Cancelled));
    }
}
