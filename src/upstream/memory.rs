use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{FetchError, FileDescriptor, FileLookup, Location, LookupError, Session};

/// Misbehaviour to inject into every fetch and lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Bytes returned beyond the requested limit, when the payload has them.
    pub extra_bytes: u64,
    /// Cap on the bytes returned by any single fetch.
    pub max_return: Option<u64>,
    /// Fetches at this offset fail with a transport error.
    pub fail_at: Option<u64>,
    /// Fetches at this offset return no bytes.
    pub empty_at: Option<u64>,
    /// Every lookup fails.
    pub lookup_fails: bool,
}

/// One fetch as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub session: usize,
    pub location: Location,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Default)]
struct State {
    files: HashMap<i64, FileDescriptor>,
    payloads: HashMap<Location, Bytes>,
    fetches: Vec<FetchRecord>,
    faults: Faults,
    lookups: usize,
}

struct Shared {
    state: Mutex<State>,
    // `true` while fetches may proceed
    gate: watch::Sender<bool>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    aliased: AtomicUsize,
}

/// In-process content provider.
///
/// Clones share the same files, fetch log and fault settings.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        MemoryStore {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                gate,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                aliased: AtomicUsize::new(0),
            }),
        }
    }

    /// Stores `content` as file `id`, sized by its length, and returns the descriptor.
    pub fn add_file(
        &self,
        id: i64,
        name: &str,
        mime_type: &str,
        content: impl Into<Bytes>,
    ) -> FileDescriptor {
        let content = content.into();
        let file = FileDescriptor {
            id,
            name: name.to_string(),
            size: content.len() as u64,
            mime_type: mime_type.to_string(),
            location: Location::new(format!("mem/{id}")),
        };
        self.insert(file.clone(), content);
        file
    }

    /// Stores `file` with an arbitrary payload. The descriptor's size is kept
    /// as given, so it may disagree with the payload (zero-size sentinels,
    /// truncated uploads).
    pub fn insert(&self, file: FileDescriptor, content: impl Into<Bytes>) {
        let mut state = self.state();
        state.payloads.insert(file.location.clone(), content.into());
        state.files.insert(file.id, file);
    }

    /// `count` sessions over this store, numbered from zero.
    pub fn sessions(&self, count: usize) -> Vec<Arc<dyn Session>> {
        (0..count)
            .map(|id| Arc::new(self.session(id)) as Arc<dyn Session>)
            .collect()
    }

    pub fn session(&self, id: usize) -> MemorySession {
        MemorySession { id, shared: Arc::clone(&self.shared), busy: AtomicBool::new(false) }
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    /// Every fetch so far, in the order they were issued.
    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.state().fetches.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state().lookups
    }

    /// Makes new and pending fetches wait until [`release`](Self::release).
    pub fn hold(&self) {
        self.shared.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.shared.gate.send_replace(true);
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Fetches that found their session already busy with another fetch.
    pub fn aliased(&self) -> usize {
        self.shared.aliased.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FileLookup for MemoryStore {
    async fn lookup(&self, id: i64) -> Result<FileDescriptor, LookupError> {
        let mut state = self.state();
        state.lookups += 1;
        if state.faults.lookup_fails {
            return Err(LookupError::Failed("lookup fault injected".to_string()));
        }
        state.files.get(&id).cloned().ok_or(LookupError::NotFound(id))
    }
}

/// Session over a [`MemoryStore`].
pub struct MemorySession {
    id: usize,
    shared: Arc<Shared>,
    busy: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> usize {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_gate(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let mut gate = self.shared.gate.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            open = gate.wait_for(|open| *open) => {
                open.map(|_| ()).map_err(|_| FetchError::Transport("store dropped".to_string()))
            }
        }
    }

    fn read(&self, location: &Location, offset: u64, limit: u64) -> Result<Bytes, FetchError> {
        let state = self.state();
        let faults = &state.faults;
        if faults.fail_at == Some(offset) {
            return Err(FetchError::Transport(format!("fault injected at offset {offset}")));
        }
        if faults.empty_at == Some(offset) {
            return Ok(Bytes::new());
        }

        let payload = state
            .payloads
            .get(location)
            .ok_or(FetchError::Status { status: 404 })?;
        let len = payload.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }

        let mut take = limit.min(faults.max_return.unwrap_or(u64::MAX));
        take = take.saturating_add(faults.extra_bytes);
        let end = offset.saturating_add(take).min(len);
        Ok(payload.slice(offset as usize..end as usize))
    }
}

/// Marks a fetch as running for as long as it is alive.
struct InFlight<'a> {
    session: &'a MemorySession,
}

impl<'a> InFlight<'a> {
    fn enter(session: &'a MemorySession) -> Self {
        if session.busy.swap(true, Ordering::SeqCst) {
            session.shared.aliased.fetch_add(1, Ordering::SeqCst);
        }
        let now = session.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        session.shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight { session }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.session.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.session.busy.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn fetch(
        &self,
        location: &Location,
        offset: u64,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FetchError> {
        self.state().fetches.push(FetchRecord {
            session: self.id,
            location: location.clone(),
            offset,
            limit,
        });

        let _in_flight = InFlight::enter(self);
        self.wait_gate(cancel).await?;
        // yield once so concurrent fetches actually overlap
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.read(location, offset, limit)
    }
}
