//! Artifact cache (LRU, in memory) with single-flight derivation.
//!
//! Flow:
//!   1. `get(entry, kind)` → hit: touch LRU and return the payload
//!   2. miss with a derivation already in flight → wait on its result
//!   3. miss otherwise → register a pending slot, spawn the derivation on
//!      the blocking pool, and wait like everyone else
//!
//! A shadow is built from the cached thumbnail when there is one; when
//! there is not, the thumbnail is derived first and cached alongside.
//!
//! Keys carry the source mtime, so a changed file simply misses; stale
//! entries age out through normal LRU eviction. Derivations run detached
//! from the requesting task: a caller that goes away does not cancel the
//! work other callers are waiting on.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::classify::FileType;
use crate::error::DerivationError;
use crate::index::FileEntry;
use crate::scanner::mtime_ms;

pub type Payload = Arc<Vec<u8>>;
type Derived = Result<Payload, DerivationError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Thumbnail,
    /// Tiny blurred placeholder shown while the thumbnail loads.
    Shadow,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::Shadow => "shadow",
        }
    }

    pub fn supports(&self, file_type: FileType) -> bool {
        matches!(file_type, FileType::Image | FileType::Video)
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thumbnail" | "thumb" | "default" => Ok(ArtifactKind::Thumbnail),
            "shadow" => Ok(ArtifactKind::Shadow),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub modified_ms: i64,
    pub kind: ArtifactKind,
}

impl CacheKey {
    pub fn new(entry: &FileEntry, kind: ArtifactKind) -> Self {
        Self {
            path: entry.path.clone(),
            modified_ms: entry.modified_ms,
            kind,
        }
    }
}

/// Produces artifacts. Both methods run on the blocking pool.
pub trait Deriver: Send + Sync + 'static {
    /// Thumbnail straight from the source file.
    fn derive(&self, source: &Path, file_type: FileType) -> Result<Vec<u8>, DerivationError>;

    /// Placeholder built from an already-derived thumbnail.
    fn shadow(&self, thumb: &[u8]) -> Result<Vec<u8>, DerivationError>;
}

#[derive(Clone, Copy, Debug)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 2048,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheOccupancy {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub derivations: u64,
    pub failures: u64,
    pub evictions: u64,
}

// ── LRU state ───────────────────────────────────────────────────────────

struct Slot {
    data: Payload,
    tick: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, Slot>,
    /// tick → key; first = least recently used
    lru: BTreeMap<u64, CacheKey>,
    bytes: usize,
    tick: u64,
    pending: HashMap<CacheKey, watch::Receiver<Option<Derived>>>,
}

impl State {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up and mark as most recently used.
    fn touch(&mut self, key: &CacheKey) -> Option<Payload> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        self.lru.remove(&slot.tick);
        slot.tick = tick;
        self.lru.insert(tick, key.clone());
        Some(slot.data.clone())
    }

    /// Insert, then evict from the cold end until within limits.
    /// Returns how many entries were evicted.
    fn insert(&mut self, key: CacheKey, data: Payload, limits: CacheLimits) -> usize {
        self.remove(&key);
        let tick = self.next_tick();
        self.bytes += data.len();
        self.lru.insert(tick, key.clone());
        self.entries.insert(key, Slot { data, tick });

        let mut evicted = 0;
        while self.entries.len() > limits.max_entries || self.bytes > limits.max_bytes {
            let Some((_, victim)) = self.lru.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&victim) {
                self.bytes -= slot.data.len();
                evicted += 1;
                debug!("cache evict {} ({})", victim.path, victim.kind.as_str());
            }
        }
        evicted
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.lru.remove(&slot.tick);
                self.bytes -= slot.data.len();
                true
            }
            None => false,
        }
    }
}

// ── Cache ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    derivations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

struct Inner {
    root: PathBuf,
    limits: CacheLimits,
    deriver: Arc<dyn Deriver>,
    state: Mutex<State>,
    counters: Counters,
}

#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<Inner>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, limits: CacheLimits, deriver: Arc<dyn Deriver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                limits,
                deriver,
                state: Mutex::new(State::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Fetch or derive an artifact. Must be called from within a tokio
    /// runtime; the derivation itself runs on the blocking pool.
    pub async fn get(&self, entry: &FileEntry, kind: ArtifactKind) -> Result<Payload, DerivationError> {
        if !kind.supports(entry.file_type) {
            return Err(DerivationError::Unsupported(entry.file_type));
        }
        let key = CacheKey::new(entry, kind);
        let c = &self.inner.counters;

        // A slot whose task died with its runtime never resolves; it is
        // replaced by a fresh derivation, once per call.
        for _ in 0..2 {
            let mut rx = {
                let mut st = self.inner.lock();
                if let Some(data) = st.touch(&key) {
                    c.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(data);
                }
                let live = st
                    .pending
                    .get(&key)
                    .filter(|rx| rx.has_changed().is_ok())
                    .cloned();
                match live {
                    Some(rx) => {
                        c.coalesced.fetch_add(1, Ordering::Relaxed);
                        rx
                    }
                    None => {
                        c.misses.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        st.pending.insert(key.clone(), rx.clone());
                        self.spawn_derivation(key.clone(), entry.file_type, tx);
                        rx
                    }
                }
            };

            if let Ok(done) = rx.wait_for(Option::is_some).await {
                if let Some(result) = &*done {
                    return result.clone();
                }
            }
            debug!("derivation of {} for {} vanished", kind.as_str(), key.path);
        }
        Err(DerivationError::Cancelled)
    }

    fn spawn_derivation(&self, key: CacheKey, file_type: FileType, tx: watch::Sender<Option<Derived>>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let source = inner.root.join(&key.path);
            inner.counters.derivations.fetch_add(1, Ordering::Relaxed);
            debug!("derive {} for {}", key.kind.as_str(), key.path);

            let result = match key.kind {
                ArtifactKind::Thumbnail => inner.thumbnail(&source, file_type).await,
                ArtifactKind::Shadow => {
                    let thumb_key = CacheKey {
                        kind: ArtifactKind::Thumbnail,
                        ..key.clone()
                    };
                    let cached = inner.lock().touch(&thumb_key);
                    let thumb = match cached {
                        Some(data) => Ok(data),
                        None => {
                            let derived = inner.thumbnail(&source, file_type).await;
                            let fresh = is_fresh(&source, &thumb_key).await;
                            inner.store(&mut inner.lock(), &thumb_key, fresh, &derived);
                            derived
                        }
                    };
                    match thumb {
                        Ok(data) => inner.blocking(move |d| d.shadow(&data)).await,
                        Err(e) => Err(e),
                    }
                }
            };

            let fresh = is_fresh(&source, &key).await;
            inner.finish(&key, fresh, &result);
            // Receivers may all be gone; the result is cached regardless.
            let _ = tx.send(Some(result));
        });
    }

    /// Drop every cached kind for `path`. Returns how many entries went.
    pub fn invalidate(&self, path: &str) -> usize {
        let mut st = self.inner.lock();
        let keys: Vec<CacheKey> = st
            .entries
            .keys()
            .filter(|k| k.path == path)
            .cloned()
            .collect();
        keys.iter().filter(|k| st.remove(k)).count()
    }

    pub fn clear(&self) -> usize {
        let mut st = self.inner.lock();
        let n = st.entries.len();
        st.entries.clear();
        st.lru.clear();
        st.bytes = 0;
        n
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn occupancy(&self) -> CacheOccupancy {
        let st = self.inner.lock();
        let c = &self.inner.counters;
        CacheOccupancy {
            entries: st.entries.len(),
            bytes: st.bytes,
            max_entries: self.inner.limits.max_entries,
            max_bytes: self.inner.limits.max_bytes,
            in_flight: st.pending.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            derivations: c.derivations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays structurally valid across a panic in another holder.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn blocking<F>(&self, f: F) -> Derived
    where
        F: FnOnce(&dyn Deriver) -> Result<Vec<u8>, DerivationError> + Send + 'static,
    {
        let deriver = self.deriver.clone();
        tokio::task::spawn_blocking(move || f(deriver.as_ref()))
            .await
            .unwrap_or_else(|e| {
                warn!("derivation task failed: {}", e);
                Err(DerivationError::Cancelled)
            })
            .map(Arc::new)
    }

    async fn thumbnail(&self, source: &Path, file_type: FileType) -> Derived {
        let src = source.to_path_buf();
        self.blocking(move |d| d.derive(&src, file_type)).await
    }

    /// Record a finished derivation: clear the pending slot and cache the
    /// payload if the source still matches the key.
    fn finish(&self, key: &CacheKey, fresh: bool, result: &Derived) {
        let mut st = self.lock();
        st.pending.remove(key);
        self.store(&mut st, key, fresh, result);
    }

    fn store(&self, st: &mut State, key: &CacheKey, fresh: bool, result: &Derived) {
        match result {
            Ok(data) if fresh && data.len() <= self.limits.max_bytes => {
                let evicted = st.insert(key.clone(), data.clone(), self.limits);
                self.counters
                    .evictions
                    .fetch_add(evicted as u64, Ordering::Relaxed);
            }
            Ok(_) => debug!("not caching {} for {}", key.kind.as_str(), key.path),
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                debug!("derive {} for {} failed: {}", key.kind.as_str(), key.path, e);
            }
        }
    }
}

/// Whether the source on disk still has the mtime the key was built from.
async fn is_fresh(source: &Path, key: &CacheKey) -> bool {
    tokio::fs::metadata(source)
        .await
        .map(|m| mtime_ms(&m) == key.modified_ms)
        .unwrap_or(false)
}
