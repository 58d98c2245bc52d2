//! Bounded pool of upstream sessions.
//!
//! The pool is the only shared mutable state in the gateway. A request holds
//! a [`SessionLease`] while it copies bytes; the lease hands the session back
//! when it is dropped, whichever way the request ends. When every session is
//! leased, [`SessionPool::acquire`] waits, which caps concurrent upstream load
//! at the pool's capacity.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::Location;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch cancelled")]
    Cancelled,

    #[error("upstream returned {status}")]
    Status { status: u16 },

    #[error("unexpected upstream response: {0}")]
    Unexpected(String),

    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// One authenticated connection to the content provider.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Fetches up to `limit` bytes of `location` starting at `offset`.
    ///
    /// Implementations must return [`FetchError::Cancelled`] promptly once
    /// `cancel` fires.
    async fn fetch(
        &self,
        location: &Location,
        offset: u64,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("session pool is closed")]
    Closed,

    #[error("session pool needs at least one session")]
    Empty,
}

struct Inner {
    idle: Mutex<VecDeque<Arc<dyn Session>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Fixed-capacity set of sessions. Cheap to clone, all clones share one pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl SessionPool {
    /// Builds a pool owning `sessions`. The capacity is their count and never grows.
    pub fn new<I>(sessions: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = Arc<dyn Session>>,
    {
        let idle: VecDeque<_> = sessions.into_iter().collect();
        if idle.is_empty() {
            return Err(PoolError::Empty);
        }
        let capacity = idle.len();
        let inner = Inner {
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        };
        Ok(SessionPool { inner: Arc::new(inner) })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Sessions not currently leased.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Waits for a free session and leases it.
    pub async fn acquire(&self) -> Result<SessionLease, PoolError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        // a permit guarantees an idle session, see `SessionLease::drop`
        let session = self.lock_idle().pop_front().ok_or(PoolError::Closed)?;
        Ok(SessionLease { session: Some(session), pool: self.clone(), _permit: permit })
    }

    /// Stops handing out sessions. Waiting and future `acquire` calls fail
    /// with [`PoolError::Closed`]; outstanding leases still return normally.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<dyn Session>>> {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of one session. Returned to the pool on drop.
pub struct SessionLease {
    session: Option<Arc<dyn Session>>,
    pool: SessionPool,
    // dropped after `drop` has pushed the session back
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&self) -> Arc<dyn Session> {
        match &self.session {
            Some(session) => Arc::clone(session),
            None => unreachable!("session is only taken on drop"),
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease").finish_non_exhaustive()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.lock_idle().push_back(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::future::join_all;

    use super::*;

    /// Session that fails the test if two holders use it at once.
    struct Exclusive {
        id: usize,
        busy: AtomicBool,
    }

    #[async_trait]
    impl Session for Exclusive {
        async fn fetch(
            &self,
            _location: &Location,
            _offset: u64,
            limit: u64,
            _cancel: &CancellationToken,
        ) -> Result<Bytes, FetchError> {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "session {} aliased", self.id);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.busy.store(false, Ordering::SeqCst);
            Ok(Bytes::from(vec![self.id as u8; limit as usize]))
        }
    }

    fn pool(size: usize) -> SessionPool {
        SessionPool::new((0..size).map(|id| {
            Arc::new(Exclusive { id, busy: AtomicBool::new(false) }) as Arc<dyn Session>
        }))
        .unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert_matches!(SessionPool::new(Vec::new()), Err(PoolError::Empty));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = pool(2);
        assert_eq!(2, pool.capacity());

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(0, pool.available());

        drop(a);
        assert_eq!(1, pool.available());
        drop(b);
        assert_eq!(2, pool.available());
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_exhausted() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second acquire should wait");

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(Ok(()), waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_no_session_is_shared() {
        let pool = pool(3);
        let location = Location::new("x");
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let tasks = (0..12).map(|_| {
            let pool = pool.clone();
            let location = location.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                let cancel = CancellationToken::new();
                for _ in 0..3 {
                    lease.session().fetch(&location, 0, 4, &cancel).await.unwrap();
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for task in join_all(tasks).await {
            task.unwrap();
        }

        assert!(max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(3, pool.available());
    }

    #[tokio::test]
    async fn test_release_on_panic() {
        let pool = pool(1);
        let task = tokio::spawn({
            let pool = pool.clone();
            async move {
                let _lease = pool.acquire().await.unwrap();
                panic!("request failed mid-stream");
            }
        });
        assert!(task.await.is_err());
        assert_eq!(1, pool.available());
        pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close();
        assert_eq!(Err(PoolError::Closed), waiter.await.unwrap());
        assert!(pool.is_closed());

        drop(held);
        assert_matches!(pool.acquire().await, Err(PoolError::Closed));
    }
}
