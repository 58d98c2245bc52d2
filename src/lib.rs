//! # stream-gateway
//!
//! Range-aware HTTP streaming for [`axum`][1] over a chunk-oriented remote
//! content provider.
//!
//! A request for `/stream/{id}?hash=<token>` is authenticated against a
//! stateless [capability token](AuthValidator), negotiated into a single
//! [`ByteWindow`] by [`Ranged`], and then served by a [`ChunkedReader`] that
//! fetches the window in fixed-size chunks through a leased upstream
//! [`Session`]. Output passes through a [`LimitSink`] so a response never
//! carries more than its declared `Content-Length`.
//!
//! The upstream is reached through two traits: [`FileLookup`] resolves ids
//! into [`FileDescriptor`]s and [`Session`] fetches byte ranges. Sessions are
//! pooled in a fixed-size [`SessionPool`], which is also the only
//! backpressure: once every session is leased, further streams wait.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stream_gateway::upstream::memory::MemoryStore;
//! use stream_gateway::{router, AuthValidator, ChunkPolicy, Gateway, SessionPool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let file = store.add_file(42, "a.mp4", "video/mp4", vec![0u8; 1_000_000]);
//!
//!     let auth = AuthValidator::new(b"process secret", 16).unwrap();
//!     println!("/stream/42?hash={}", auth.token_for(&file));
//!
//!     let pool = SessionPool::new(store.sessions(4)).unwrap();
//!     let gateway = Gateway::new(Arc::new(store), pool, auth, ChunkPolicy::default());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, router(Arc::new(gateway))).await.unwrap();
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

mod auth;
mod config;
mod error;
mod file;
mod gateway;
mod guard;
mod pool;
mod range;
mod reader;
mod stream;

pub mod upstream;

use std::fmt;

pub use auth::{AuthError, AuthValidator};
pub use config::{Config, ConfigError, ServerConfig, StreamConfig, UpstreamConfig};
pub use error::StreamError;
pub use file::{FileDescriptor, FileLookup, Location, LookupError};
pub use gateway::{router, Gateway, StreamQuery, StreamRequest};
pub use guard::{BufferedSink, ByteSink, ChannelSink, GzipSink, LimitSink, SinkError};
pub use pool::{FetchError, PoolError, Session, SessionLease, SessionPool};
pub use range::{
    etag_for, parse_range_header, ChunkPolicy, Disposition, RangeError, Ranged, RangedResponse,
};
pub use reader::{ChunkedReader, ReadError};
pub use stream::RangedStream;

/// An inclusive byte window `[start, end]` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    /// Callers keep `start <= end`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "empty byte window {start}-{end}");
        ByteWindow { start, end }
    }

    /// Number of bytes covered, `end - start + 1`.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Same start, end pulled in so the window covers at most `max_len` bytes.
    pub fn bounded(self, max_len: u64) -> Self {
        let max_len = max_len.max(1);
        if self.len() <= max_len {
            self
        } else {
            ByteWindow { start: self.start, end: self.start + max_len - 1 }
        }
    }
}

impl fmt::Display for ByteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
