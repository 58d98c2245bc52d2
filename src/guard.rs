//! Output side of a stream: composable byte sinks.
//!
//! The gateway writes through `LimitSink -> [GzipSink] -> BufferedSink ->
//! ChannelSink`. [`LimitSink`] sits first so the declared `Content-Length`
//! is never exceeded regardless of what upstream hands back.

use std::{io, mem};

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("byte limit reached")]
    LimitReached,

    #[error("sink closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError>;

    /// Flushes and ends the output. Further writes fail.
    async fn close(&mut self) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: ByteSink + ?Sized> ByteSink for Box<S> {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        (**self).write(chunk).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush().await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        (**self).close().await
    }
}

/// Passes at most `limit` bytes through to `inner`.
///
/// A write that would cross the limit forwards the prefix that fits and
/// then fails with [`SinkError::LimitReached`], as does any later write.
#[derive(Debug)]
pub struct LimitSink<S> {
    inner: S,
    remaining: u64,
}

impl<S: ByteSink> LimitSink<S> {
    pub fn new(inner: S, limit: u64) -> Self {
        LimitSink { inner, remaining: limit }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for LimitSink<S> {
    async fn write(&mut self, mut chunk: Bytes) -> Result<(), SinkError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.remaining == 0 {
            return Err(SinkError::LimitReached);
        }

        let len = chunk.len() as u64;
        if len <= self.remaining {
            self.remaining -= len;
            return self.inner.write(chunk).await;
        }

        chunk.truncate(self.remaining as usize);
        self.remaining = 0;
        self.inner.write(chunk).await?;
        Err(SinkError::LimitReached)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.inner.close().await
    }
}

/// Coalesces small writes into frames of up to `capacity` bytes.
#[derive(Debug)]
pub struct BufferedSink<S> {
    inner: S,
    buffer: BytesMut,
    capacity: usize,
}

impl<S: ByteSink> BufferedSink<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        BufferedSink { inner, buffer: BytesMut::with_capacity(capacity), capacity }
    }

    async fn drain(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let frame = self.buffer.split().freeze();
        self.inner.write(frame).await
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for BufferedSink<S> {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.buffer.len() + chunk.len() > self.capacity {
            self.drain().await?;
        }
        if chunk.len() >= self.capacity {
            return self.inner.write(chunk).await;
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.drain().await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.drain().await?;
        self.inner.close().await
    }
}

/// Gzip-compresses everything written and forwards the compressed frames.
pub struct GzipSink<S> {
    encoder: GzipEncoder<Vec<u8>>,
    inner: S,
}

impl<S: ByteSink> GzipSink<S> {
    pub fn new(inner: S) -> Self {
        GzipSink { encoder: GzipEncoder::new(Vec::new()), inner }
    }

    async fn forward(&mut self) -> Result<(), SinkError> {
        let compressed = mem::take(self.encoder.get_mut());
        if compressed.is_empty() {
            return Ok(());
        }
        self.inner.write(Bytes::from(compressed)).await
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for GzipSink<S> {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.encoder.write_all(&chunk).await?;
        self.forward().await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.encoder.flush().await?;
        self.forward().await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.encoder.shutdown().await?;
        self.forward().await?;
        self.inner.close().await
    }
}

/// Hands frames to the response body through a bounded channel.
///
/// A full channel makes `write` wait, which is how a slow client slows the
/// upstream reads down. A dropped receiver surfaces as [`SinkError::Closed`].
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        ChannelSink { tx: Some(tx) }
    }
}

#[async_trait]
impl ByteSink for ChannelSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        tx.send(Ok(chunk)).await.map_err(|_| SinkError::Closed)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        match &self.tx {
            Some(tx) if tx.is_closed() => Err(SinkError::Closed),
            _ => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use async_compression::tokio::bufread::GzipDecoder;
    use tokio::io::AsyncReadExt;

    use super::*;

    /// Records every frame it receives.
    #[derive(Clone, Default)]
    struct Collect {
        frames: Arc<Mutex<Vec<Bytes>>>,
        flushes: Arc<Mutex<usize>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Collect {
        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }

        fn concat(&self) -> Vec<u8> {
            self.frames().concat()
        }
    }

    #[async_trait]
    impl ByteSink for Collect {
        async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
            if *self.closed.lock().unwrap() {
                return Err(SinkError::Closed);
            }
            self.frames.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SinkError> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_limit_truncates_and_stops() {
        let out = Collect::default();
        let mut sink = LimitSink::new(out.clone(), 10);

        sink.write(Bytes::from_static(b"0123")).await.unwrap();
        assert_eq!(6, sink.remaining());
        assert_matches!(
            sink.write(Bytes::from_static(b"456789abcdef")).await,
            Err(SinkError::LimitReached)
        );
        assert_eq!(0, sink.remaining());
        assert_matches!(sink.write(Bytes::from_static(b"x")).await, Err(SinkError::LimitReached));

        assert_eq!(b"0123456789".to_vec(), out.concat());
    }

    #[tokio::test]
    async fn test_limit_never_exceeded() {
        for limit in [0u64, 1, 7, 16, 33] {
            let out = Collect::default();
            let mut sink = LimitSink::new(out.clone(), limit);
            for _ in 0..10 {
                if sink.write(Bytes::from_static(b"abcd")).await.is_err() {
                    break;
                }
            }
            assert_eq!(limit.min(40), out.concat().len() as u64, "limit {limit}");
        }
    }

    #[tokio::test]
    async fn test_limit_ignores_empty_writes() {
        let out = Collect::default();
        let mut sink = LimitSink::new(out.clone(), 0);
        sink.write(Bytes::new()).await.unwrap();
        assert!(out.frames().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_coalesces() {
        let out = Collect::default();
        let mut sink = BufferedSink::new(out.clone(), 8);

        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.write(Bytes::from_static(b"def")).await.unwrap();
        assert!(out.frames().is_empty());

        // would overflow, so the buffered bytes go out first
        sink.write(Bytes::from_static(b"ghi")).await.unwrap();
        assert_eq!(vec![Bytes::from_static(b"abcdef")], out.frames());

        // large writes bypass the buffer once it is drained
        sink.write(Bytes::from_static(b"0123456789")).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(
            vec![
                Bytes::from_static(b"abcdef"),
                Bytes::from_static(b"ghi"),
                Bytes::from_static(b"0123456789"),
            ],
            out.frames()
        );
        assert!(*out.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_buffered_flush_pushes_through() {
        let out = Collect::default();
        let mut sink = BufferedSink::new(out.clone(), 64);
        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(vec![Bytes::from_static(b"abc")], out.frames());
        assert_eq!(1, *out.flushes.lock().unwrap());
    }

    #[tokio::test]
    async fn test_gzip_output_decodes() {
        let out = Collect::default();
        let mut sink = GzipSink::new(out.clone());

        let text = b"the quick brown fox jumps over the lazy dog\n".repeat(200);
        for piece in text.chunks(300) {
            sink.write(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        sink.close().await.unwrap();

        let compressed = out.concat();
        assert!(compressed.len() < text.len());

        let mut decoded = Vec::new();
        GzipDecoder::new(&compressed[..]).read_to_end(&mut decoded).await.unwrap();
        assert_eq!(text, decoded);
    }

    #[tokio::test]
    async fn test_channel_delivers_and_closes() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink::new(tx);

        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.close().await.unwrap();
        assert_matches!(sink.write(Bytes::from_static(b"x")).await, Err(SinkError::Closed));

        assert_eq!(Bytes::from_static(b"abc"), rx.recv().await.unwrap().unwrap());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_reports_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);
        drop(rx);
        assert_matches!(sink.write(Bytes::from_static(b"abc")).await, Err(SinkError::Closed));
        assert_matches!(sink.flush().await, Err(SinkError::Closed));
    }
}
