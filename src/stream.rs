use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// Response body stream. Implements [`Stream`], [`Body`], and [`IntoResponse`].
///
/// When the length is known it is reported as an exact size hint, so hyper
/// frames the response with that `Content-Length` and treats an early end as
/// an error. Dropping the stream (the client went away) drops the attached
/// guard, which cancels the producer.
#[pin_project]
pub struct RangedStream<S> {
    #[pin]
    inner: S,
    length: Option<u64>,
    sent: u64,
    _cancel: Option<DropGuard>,
}

impl<S> RangedStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pub fn new(inner: S, length: Option<u64>) -> Self {
        RangedStream { inner, length, sent: 0, _cancel: None }
    }

    /// Cancels `guard`'s token when this stream is dropped.
    pub fn with_cancel_guard(mut self, guard: DropGuard) -> Self {
        self._cancel = Some(guard);
        self
    }
}

impl RangedStream<()> {
    /// Body fed by a producer task through `rx`.
    pub fn from_channel(
        mut rx: mpsc::Receiver<io::Result<Bytes>>,
        length: Option<u64>,
    ) -> RangedStream<impl Stream<Item = io::Result<Bytes>> + Send + 'static> {
        let inner = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        RangedStream::new(inner, length)
    }
}

impl<S> IntoResponse for RangedStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<S> Body for RangedStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        match self.length {
            Some(length) => SizeHint::with_exact(length),
            None => SizeHint::default(),
        }
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<S> Stream for RangedStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                *this.sent += chunk.len() as u64;
                if let Some(length) = *this.length {
                    if *this.sent > length {
                        let err = io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("body exceeds declared length {length}"),
                        );
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
