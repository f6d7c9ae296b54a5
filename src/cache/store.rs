//! Underlying key/value store.
//!
//! [`KeyValueStore`] is the seam to the process-wide store the cache sits on.
//! The core relies on one capability of it: an entry that names dependency
//! keys is dropped when one of those keys is replaced or removed. The core
//! never walks dependencies itself; it only manufactures the watched keys.
//!
//! [`MemoryStore`] is the in-process implementation. It keeps the dependency
//! edges in a [`DependencyGraph`], evaluates expiry lazily, evicts by LRU when
//! over capacity and dispatches removal callbacks after releasing its lock.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use lru::LruCache;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::trace;

use super::graph::DependencyGraph;
use super::lock::mutex_lock;
use super::value::{CacheValue, Priority, RemovalReason, RemovedCallback};

const SOURCE: &str = "cache::store";

/// An entry as handed to the store.
#[derive(Clone)]
pub struct StoredEntry {
    pub value: CacheValue,
    /// Full keys of the entries this one watches.
    pub dependency_keys: Vec<String>,
    pub dependency_files: Vec<PathBuf>,
    pub absolute_expiration: Option<OffsetDateTime>,
    pub sliding_expiration: Option<Duration>,
    pub priority: Priority,
    pub on_removed: Option<RemovedCallback>,
}

impl StoredEntry {
    pub fn new(value: CacheValue) -> Self {
        Self {
            value,
            dependency_keys: Vec::new(),
            dependency_files: Vec::new(),
            absolute_expiration: None,
            sliding_expiration: None,
            priority: Priority::Normal,
            on_removed: None,
        }
    }
}

/// Observable metadata of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub absolute_expiration: Option<OffsetDateTime>,
    pub sliding_expiration: Option<Duration>,
    pub priority: Priority,
    /// Increases on every insert; a touched key gets a new generation.
    pub generation: u64,
}

/// Process-wide key/value store with native dependency triggers.
pub trait KeyValueStore: Send + Sync {
    /// Insert or replace. Replacing counts as a change of the key for its dependents.
    fn insert(&self, key: String, entry: StoredEntry);

    fn get(&self, key: &str) -> Option<CacheValue>;

    /// Live-entry check that does not count as an access.
    fn contains(&self, key: &str) -> bool;

    fn metadata(&self, key: &str) -> Option<EntryMetadata>;

    /// Remove the entry; returns false when it was absent.
    fn remove(&self, key: &str) -> bool;

    /// Snapshot of live keys.
    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many entries left the store.
    fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn capture(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            modified: read_modified(path),
        }
    }

    fn changed(&self) -> bool {
        read_modified(&self.path) != self.modified
    }
}

fn read_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
}

struct Slot {
    entry: StoredEntry,
    stamps: Vec<FileStamp>,
    last_access: OffsetDateTime,
    generation: u64,
}

impl Slot {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        if let Some(absolute) = self.entry.absolute_expiration
            && absolute <= now
        {
            return true;
        }
        if let Some(sliding) = self.entry.sliding_expiration
            && expires_after(self.last_access, sliding) <= now
        {
            return true;
        }
        false
    }
}

struct Removal {
    key: String,
    value: CacheValue,
    callback: Option<RemovedCallback>,
    reason: RemovalReason,
}

struct Inner {
    entries: LruCache<String, Slot>,
    graph: DependencyGraph,
    generation: u64,
}

impl Inner {
    /// Remove `key` and, transitively, everything depending on it.
    fn detach(&mut self, key: &str, reason: RemovalReason, removed: &mut Vec<Removal>) {
        let mut pending = vec![(key.to_string(), reason)];
        while let Some((key, reason)) = pending.pop() {
            let Some(slot) = self.entries.pop(&key) else {
                continue;
            };
            self.graph.unregister(&key);
            for dependent in self.graph.take_dependents(&key) {
                pending.push((dependent, RemovalReason::DependencyChanged));
            }
            removed.push(Removal {
                key,
                value: slot.entry.value,
                callback: slot.entry.on_removed,
                reason,
            });
        }
    }

    fn evict_overflow(&mut self, capacity: NonZeroUsize, removed: &mut Vec<Removal>) {
        while self.entries.len() > capacity.get() {
            // iter() runs most to least recently used; min_by_key keeps the first minimum.
            let victim = self
                .entries
                .iter()
                .rev()
                .filter(|(_, slot)| slot.entry.priority != Priority::NotRemovable)
                .min_by_key(|(_, slot)| slot.entry.priority)
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => self.detach(&key, RemovalReason::Underused, removed),
                None => break,
            }
        }
    }
}

enum Lookup {
    Missing,
    Expired,
    Live {
        value: CacheValue,
        stamps: Vec<FileStamp>,
        generation: u64,
    },
}

/// In-process store with LRU capacity, lazy expiry and a dependency graph.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    capacity: NonZeroUsize,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                graph: DependencyGraph::new(),
                generation: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Number of entries currently watched by at least one dependent.
    pub fn watched_key_count(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "watched_key_count")
            .graph
            .watched_count()
    }

    /// Keys of the entries that depend on `key`.
    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        let mut dependents: Vec<String> = mutex_lock(&self.inner, SOURCE, "dependents_of")
            .graph
            .dependents_of(key)
            .into_iter()
            .collect();
        dependents.sort();
        dependents
    }

    /// Drop every entry without firing cascades through the graph.
    pub fn clear(&self) {
        let removed: Vec<Removal> = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
            inner.graph.clear();
            let mut removed = Vec::with_capacity(inner.entries.len());
            while let Some((key, slot)) = inner.entries.pop_lru() {
                removed.push(Removal {
                    key,
                    value: slot.entry.value,
                    callback: slot.entry.on_removed,
                    reason: RemovalReason::Removed,
                });
            }
            removed
        };
        dispatch(removed);
    }
}

impl KeyValueStore for MemoryStore {
    fn insert(&self, key: String, entry: StoredEntry) {
        let stamps: Vec<FileStamp> = entry
            .dependency_files
            .iter()
            .map(|path| FileStamp::capture(path))
            .collect();
        let now = OffsetDateTime::now_utc();
        let mut removed = Vec::new();
        {
            let mut inner = mutex_lock(&self.inner, SOURCE, "insert");
            inner.detach(&key, RemovalReason::Removed, &mut removed);

            // A dependency on a key that is not present never fires.
            let watched: Vec<String> = entry
                .dependency_keys
                .iter()
                .filter(|watched| inner.entries.contains(watched.as_str()))
                .cloned()
                .collect();
            inner.graph.register(&key, watched);

            inner.generation += 1;
            let generation = inner.generation;
            inner.entries.put(
                key,
                Slot {
                    entry,
                    stamps,
                    last_access: now,
                    generation,
                },
            );
            inner.evict_overflow(self.capacity, &mut removed);
        }
        dispatch(removed);
    }

    fn get(&self, key: &str) -> Option<CacheValue> {
        let now = OffsetDateTime::now_utc();
        let mut removed = Vec::new();
        let lookup = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "get");
            let lookup = match inner.entries.get_mut(key) {
                None => Lookup::Missing,
                Some(slot) if slot.is_expired(now) => Lookup::Expired,
                Some(slot) => {
                    slot.last_access = now;
                    Lookup::Live {
                        value: slot.entry.value.clone(),
                        stamps: slot.stamps.clone(),
                        generation: slot.generation,
                    }
                }
            };
            if matches!(lookup, Lookup::Expired) {
                inner.detach(key, RemovalReason::Expired, &mut removed);
            }
            lookup
        };
        dispatch(removed);

        let Lookup::Live {
            value,
            stamps,
            generation,
        } = lookup
        else {
            return None;
        };

        if stamps.iter().any(FileStamp::changed) {
            let mut removed = Vec::new();
            {
                let mut inner = mutex_lock(&self.inner, SOURCE, "get.file_dependency");
                let same_entry = inner
                    .entries
                    .peek(key)
                    .is_some_and(|slot| slot.generation == generation);
                if same_entry {
                    inner.detach(key, RemovalReason::DependencyChanged, &mut removed);
                }
            }
            dispatch(removed);
            return None;
        }

        Some(value)
    }

    fn contains(&self, key: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        mutex_lock(&self.inner, SOURCE, "contains")
            .entries
            .peek(key)
            .is_some_and(|slot| !slot.is_expired(now))
    }

    fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        mutex_lock(&self.inner, SOURCE, "metadata")
            .entries
            .peek(key)
            .map(|slot| EntryMetadata {
                absolute_expiration: slot.entry.absolute_expiration,
                sliding_expiration: slot.entry.sliding_expiration,
                priority: slot.entry.priority,
                generation: slot.generation,
            })
    }

    fn remove(&self, key: &str) -> bool {
        let mut removed = Vec::new();
        mutex_lock(&self.inner, SOURCE, "remove").detach(key, RemovalReason::Removed, &mut removed);
        let found = !removed.is_empty();
        dispatch(removed);
        found
    }

    fn keys(&self) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        mutex_lock(&self.inner, SOURCE, "keys")
            .entries
            .iter()
            .filter(|(_, slot)| !slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut removed = Vec::new();
        {
            let mut inner = mutex_lock(&self.inner, SOURCE, "purge_expired");
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, slot)| slot.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                inner.detach(&key, RemovalReason::Expired, &mut removed);
            }
        }
        let count = removed.len();
        dispatch(removed);
        count
    }
}

/// `start + lifetime`, saturating at the latest representable instant.
pub(crate) fn expires_after(start: OffsetDateTime, lifetime: Duration) -> OffsetDateTime {
    start
        .checked_add(lifetime)
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}

fn dispatch(removed: Vec<Removal>) {
    for removal in removed {
        trace!(
            key = %removal.key,
            reason = removal.reason.as_str(),
            value_kind = removal.value.kind(),
            "Cache entry left the store"
        );
        if let Some(callback) = removal.callback {
            callback(&removal.key, &removal.value, removal.reason);
        }
    }
}
