use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::{ByteWindow, FetchError, Location, SessionLease};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("fetch at offset {offset} (window ends at {end}) failed: {source}")]
    Upstream {
        offset: u64,
        end: u64,
        #[source]
        source: FetchError,
    },

    #[error("upstream returned no bytes at offset {offset}, window ends at {end}")]
    Shortfall { offset: u64, end: u64 },

    #[error("upstream returned {returned} bytes at offset {offset}, asked for {requested}")]
    Oversized { offset: u64, requested: u64, returned: u64 },

    #[error("read cancelled")]
    Cancelled,

    #[error("reader failed earlier")]
    Failed,
}

impl From<ReadError> for io::Error {
    fn from(err: ReadError) -> Self {
        let kind = match err {
            ReadError::Shortfall { .. } => io::ErrorKind::UnexpectedEof,
            ReadError::Cancelled => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Sequential reader over one [`ByteWindow`] of a remote file.
///
/// Each time its buffer runs dry the reader issues a single fetch of
/// `min(chunk_size, bytes left in window)` at the cursor, strictly in
/// increasing offset order. It never asks for bytes outside the window and
/// never retries: the first failed or empty fetch ends the read.
pub struct ChunkedReader {
    // holds a clone of the leased session, declared before `lease` so it is
    // dropped before the session goes back to the pool
    pending: Option<BoxFuture<'static, Result<Bytes, FetchError>>>,
    lease: SessionLease,
    location: Location,
    window: ByteWindow,
    chunk_size: u64,
    cursor: u64,
    buffer: Bytes,
    cancel: CancellationToken,
    failed: bool,
}

impl ChunkedReader {
    pub fn new(
        lease: SessionLease,
        location: Location,
        window: ByteWindow,
        chunk_size: u64,
        cancel: CancellationToken,
    ) -> Self {
        ChunkedReader {
            pending: None,
            lease,
            location,
            window,
            chunk_size: chunk_size.max(1),
            cursor: window.start,
            buffer: Bytes::new(),
            cancel,
            failed: false,
        }
    }

    pub fn window(&self) -> ByteWindow {
        self.window
    }

    /// Offset of the next byte a caller will receive.
    pub fn position(&self) -> u64 {
        self.cursor - self.buffer.len() as u64
    }

    /// Whether every byte of the window has been handed out.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty() && self.cursor > self.window.end
    }

    /// Returns the next at most `max` buffered bytes, fetching a chunk first
    /// if the buffer is empty. `Ok(None)` once the window is exhausted.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, ReadError> {
        poll_fn(|cx| self.poll_fill(cx)).await?;
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let n = self.buffer.len().min(max.max(1));
        Ok(Some(self.buffer.split_to(n)))
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), ReadError>> {
        if self.failed {
            return Poll::Ready(Err(ReadError::Failed));
        }
        if !self.buffer.is_empty() || self.cursor > self.window.end {
            return Poll::Ready(Ok(()));
        }

        let mut fetch = self.pending.take().unwrap_or_else(|| self.start_fetch());
        let fetched = match fetch.poll_unpin(cx) {
            Poll::Pending => {
                self.pending = Some(fetch);
                return Poll::Pending;
            }
            Poll::Ready(fetched) => fetched,
        };

        match self.accept(fetched) {
            Ok(chunk) => {
                self.buffer = chunk;
                Poll::Ready(Ok(()))
            }
            Err(err) => {
                self.failed = true;
                Poll::Ready(Err(err))
            }
        }
    }

    fn next_limit(&self) -> u64 {
        self.chunk_size.min(self.window.end + 1 - self.cursor)
    }

    fn start_fetch(&self) -> BoxFuture<'static, Result<Bytes, FetchError>> {
        let session = self.lease.session();
        let location = self.location.clone();
        let cancel = self.cancel.clone();
        let offset = self.cursor;
        let limit = self.next_limit();
        tracing::trace!(offset, limit, "fetching chunk");
        Box::pin(async move { session.fetch(&location, offset, limit, &cancel).await })
    }

    fn accept(&mut self, fetched: Result<Bytes, FetchError>) -> Result<Bytes, ReadError> {
        let offset = self.cursor;
        let end = self.window.end;
        let requested = self.next_limit();
        let chunk = match fetched {
            Ok(chunk) => chunk,
            Err(FetchError::Cancelled) => return Err(ReadError::Cancelled),
            Err(source) => return Err(ReadError::Upstream { offset, end, source }),
        };

        let returned = chunk.len() as u64;
        if returned == 0 {
            return Err(ReadError::Shortfall { offset, end });
        }
        if returned > requested {
            return Err(ReadError::Oversized { offset, requested, returned });
        }
        self.cursor += returned;
        Ok(chunk)
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_fill(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
            Poll::Ready(Ok(())) => {}
        }

        let n = this.buffer.len().min(buf.remaining());
        buf.put_slice(&this.buffer.split_to(n));
        Poll::Ready(Ok(()))
    }
}
