use super::{ChunkReader, Reader};
use crate::chunk::{chunk_key, ChunkError};
use crate::storage::StorageError;
use crate::structure::ChunkIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Concurrent storage fetches per `acquire` call.
const FETCH_WORKERS: usize = 4;

/// One cold chunk a query wants materialized. Ordered by ID, which is also
/// (depth, ID) order since deeper spans start at larger indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchInfo {
    pub id: ChunkIndex,
    pub chunk_points: u64,
    pub depth: u64,
}

#[derive(Debug, Clone)]
pub enum CacheError {
    Storage(StorageError),
    Chunk(String),
    /// Every resident entry is pinned and the request needs more room; the
    /// caller should drain outstanding blocks and retry.
    Backpressure { pinned: usize, max_chunks: usize },
    /// The acquire deadline expired while waiting on another thread's
    /// materialization.
    Timeout,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(error) => write!(f, "{error}"),
            Self::Chunk(message) => write!(f, "{message}"),
            Self::Backpressure { pinned, max_chunks } => write!(
                f,
                "cache holds {pinned} pinned chunks against a limit of {max_chunks}"
            ),
            Self::Timeout => write!(f, "chunk acquisition deadline expired"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<StorageError> for CacheError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<ChunkError> for CacheError {
    fn from(value: ChunkError) -> Self {
        Self::Chunk(value.to_string())
    }
}

type Key = (String, ChunkIndex);

/// Outcome of one materialization: `Ok(None)` means the blob was absent.
type FetchOutcome = Result<Option<Arc<ChunkReader>>, CacheError>;

/// One-shot rendezvous for acquires coalescing on a missing key.
struct LoadGate {
    outcome: Mutex<Option<FetchOutcome>>,
    ready: Condvar,
}

impl LoadGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn publish(&self, outcome: FetchOutcome) {
        let mut slot = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self, deadline: Option<(Instant, Duration)>) -> Result<FetchOutcome, CacheError> {
        let mut slot = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Ok(outcome.clone());
            }
            match deadline {
                None => {
                    slot = self
                        .ready
                        .wait(slot)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some((start, limit)) => {
                    let Some(remaining) = limit.checked_sub(start.elapsed()) else {
                        return Err(CacheError::Timeout);
                    };
                    let (guard, timeout) = self
                        .ready
                        .wait_timeout(slot, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    slot = guard;
                    if timeout.timed_out() && slot.is_none() {
                        return Err(CacheError::Timeout);
                    }
                }
            }
        }
    }
}

struct CacheEntry {
    reader: Arc<ChunkReader>,
    pins: usize,
    released_at: u64,
}

enum Slot {
    Loading(Arc<LoadGate>),
    Ready(CacheEntry),
}

struct CacheState {
    slots: HashMap<Key, Slot>,
    release_seq: u64,
}

/// Reference-counted chunk cache keyed by `(index path, chunk ID)`. The
/// only component that touches chunk storage at query time: misses fetch
/// and decode on a bounded set of worker threads, concurrent requests for
/// one key coalesce onto a single fetch, and entries evict in
/// least-recently-released order once unpinned.
pub struct Cache {
    max_chunks: usize,
    state: Mutex<CacheState>,
}

impl Cache {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            max_chunks,
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                release_seq: 0,
            }),
        }
    }

    /// Resident (materialized) chunk count.
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str, id: ChunkIndex) -> bool {
        matches!(
            self.lock().slots.get(&(path.to_string(), id)),
            Some(Slot::Ready(_))
        )
    }

    /// Materialize and pin `fetches`, returning a block owning one pin per
    /// acquired chunk. Chunks whose blob is absent are skipped; an empty
    /// result is `Ok(None)`. On any hard failure or deadline expiry every
    /// provisionally-taken pin is released before returning.
    pub fn acquire(
        self: &Arc<Self>,
        reader: &Reader,
        fetches: &BTreeSet<FetchInfo>,
        deadline: Option<Duration>,
    ) -> Result<Option<Block>, CacheError> {
        if fetches.is_empty() {
            return Ok(None);
        }
        let start = Instant::now();
        let path = reader.path().to_string();

        let mut pinned = BTreeMap::new();
        let mut to_fetch: Vec<(FetchInfo, Arc<LoadGate>)> = Vec::new();
        let mut waiting: Vec<(ChunkIndex, Arc<LoadGate>)> = Vec::new();
        {
            let mut state = self.lock();
            for fetch in fetches {
                let key = (path.clone(), fetch.id);
                match state.slots.get_mut(&key) {
                    Some(Slot::Ready(entry)) => {
                        entry.pins += 1;
                        pinned.insert(fetch.id, entry.reader.clone());
                    }
                    Some(Slot::Loading(gate)) => {
                        waiting.push((fetch.id, gate.clone()));
                    }
                    None => {
                        let gate = LoadGate::new();
                        state.slots.insert(key, Slot::Loading(gate.clone()));
                        to_fetch.push((*fetch, gate));
                    }
                }
            }

            let pins_needed = to_fetch.len() + waiting.len();
            let pinned_already = state
                .slots
                .values()
                .filter(|slot| matches!(slot, Slot::Ready(entry) if entry.pins > 0))
                .count();
            if pinned_already + pins_needed > self.max_chunks {
                for (fetch, gate) in &to_fetch {
                    state.slots.remove(&(path.clone(), fetch.id));
                    gate.publish(Ok(None));
                }
                let ids: Vec<ChunkIndex> = pinned.keys().copied().collect();
                drop(state);
                self.release(&path, &ids);
                return Err(CacheError::Backpressure {
                    pinned: pinned_already,
                    max_chunks: self.max_chunks,
                });
            }
        }

        // Fetch misses on a bounded pool of scoped workers; each publishes
        // its outcome through the gate other acquires may be waiting on.
        if !to_fetch.is_empty() {
            let path_ref: &str = &path;
            std::thread::scope(|scope| {
                for group in to_fetch.chunks(to_fetch.len().div_ceil(FETCH_WORKERS)) {
                    scope.spawn(move || {
                        for (fetch, gate) in group {
                            let outcome = self.materialize(reader, fetch);
                            self.publish(path_ref, fetch.id, gate, outcome);
                        }
                    });
                }
            });
        }

        let mut failure: Option<CacheError> = None;
        for (fetch, gate) in &to_fetch {
            match gate.wait(None) {
                Ok(Ok(Some(chunk_reader))) => {
                    pinned.insert(fetch.id, chunk_reader);
                }
                Ok(Ok(None)) => {}
                Ok(Err(error)) | Err(error) => failure = Some(error),
            }
        }

        let wait_deadline = deadline.map(|limit| (start, limit));
        for (id, gate) in &waiting {
            if failure.is_some() {
                break;
            }
            match gate.wait(wait_deadline) {
                Ok(Ok(Some(chunk_reader))) => {
                    self.pin_ready(&path, *id, chunk_reader.clone());
                    pinned.insert(*id, chunk_reader);
                }
                Ok(Ok(None)) => {}
                Ok(Err(error)) | Err(error) => failure = Some(error),
            }
        }

        if let Some(error) = failure {
            let ids: Vec<ChunkIndex> = pinned.keys().copied().collect();
            self.release(&path, &ids);
            return Err(error);
        }

        {
            let mut state = self.lock();
            Self::evict_over_budget(&mut state, self.max_chunks);
        }

        if pinned.is_empty() {
            return Ok(None);
        }
        Ok(Some(Block {
            cache: self.clone(),
            path,
            chunks: pinned,
        }))
    }

    fn materialize(&self, reader: &Reader, fetch: &FetchInfo) -> FetchOutcome {
        let bytes = match reader.storage().get(&chunk_key(fetch.id)) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(key)) => {
                log::warn!("chunk {key} listed in the index but missing from storage; skipping");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        ChunkReader::new(
            reader.schema(),
            reader.bounds_cubic(),
            fetch.depth,
            reader.structure().is_3d(),
            fetch.chunk_points,
            bytes,
        )
        .map(|chunk_reader| Some(Arc::new(chunk_reader)))
        .map_err(CacheError::from)
    }

    /// Swap a loading slot for its outcome: resident and pinned on success,
    /// absent otherwise.
    fn publish(&self, path: &str, id: ChunkIndex, gate: &Arc<LoadGate>, outcome: FetchOutcome) {
        {
            let mut state = self.lock();
            let key = (path.to_string(), id);
            match &outcome {
                Ok(Some(chunk_reader)) => {
                    state.slots.insert(
                        key,
                        Slot::Ready(CacheEntry {
                            reader: chunk_reader.clone(),
                            pins: 1,
                            released_at: 0,
                        }),
                    );
                }
                _ => {
                    state.slots.remove(&key);
                }
            }
        }
        gate.publish(outcome);
    }

    /// Pin a chunk another acquire materialized. The entry may already have
    /// been evicted between its publish and this pin; reinsert it then.
    fn pin_ready(&self, path: &str, id: ChunkIndex, chunk_reader: Arc<ChunkReader>) {
        let mut state = self.lock();
        match state.slots.get_mut(&(path.to_string(), id)) {
            Some(Slot::Ready(entry)) => entry.pins += 1,
            _ => {
                state.slots.insert(
                    (path.to_string(), id),
                    Slot::Ready(CacheEntry {
                        reader: chunk_reader,
                        pins: 1,
                        released_at: 0,
                    }),
                );
            }
        }
    }

    fn release(&self, path: &str, ids: &[ChunkIndex]) {
        let mut state = self.lock();
        for id in ids {
            let mut needs_seq = false;
            if let Some(Slot::Ready(entry)) = state.slots.get_mut(&(path.to_string(), *id)) {
                entry.pins = entry.pins.saturating_sub(1);
                needs_seq = entry.pins == 0;
            }
            if needs_seq {
                state.release_seq += 1;
                let release_seq = state.release_seq;
                if let Some(Slot::Ready(entry)) = state.slots.get_mut(&(path.to_string(), *id)) {
                    entry.released_at = release_seq;
                }
            }
        }
        Self::evict_over_budget(&mut state, self.max_chunks);
    }

    /// Drop unpinned entries, least recently released first, until the
    /// resident count fits the limit. Pinned entries never evict.
    fn evict_over_budget(state: &mut CacheState, max_chunks: usize) {
        loop {
            let resident = state
                .slots
                .values()
                .filter(|slot| matches!(slot, Slot::Ready(_)))
                .count();
            if resident <= max_chunks {
                return;
            }
            let victim = state
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) if entry.pins == 0 => Some((entry.released_at, key.clone())),
                    _ => None,
                })
                .min();
            let Some((_, key)) = victim else {
                return;
            };
            log::debug!("evicting chunk {} of index {}", key.1, key.0);
            state.slots.remove(&key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A pinned set of chunk readers. Every chunk in `chunk_map` stays resident
/// until the block drops, which releases exactly those pins.
pub struct Block {
    cache: Arc<Cache>,
    path: String,
    chunks: BTreeMap<ChunkIndex, Arc<ChunkReader>>,
}

impl Block {
    /// The acquired chunks in ascending chunk-ID order.
    pub fn chunk_map(&self) -> &BTreeMap<ChunkIndex, Arc<ChunkReader>> {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let ids: Vec<ChunkIndex> = self.chunks.keys().copied().collect();
        self.cache.release(&self.path, &ids);
    }
}
