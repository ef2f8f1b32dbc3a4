use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use serde::Serialize;

use crate::config::Config;

use super::{CacheContents, CacheEntry, FsCache, ResourceId};

/// An entry saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    entry: Arc<CacheEntry>,
    /// The "cost" of keeping this item in memory, computed once on insertion.
    weight: u32,
}

impl InMemoryItem {
    fn new(entry: CacheEntry) -> Self {
        let weight = entry.approximate_size().try_into().unwrap_or(u32::MAX);
        Self {
            entry: Arc::new(entry),
            weight,
        }
    }
}

type InMemoryCache = moka::sync::Cache<ResourceId, InMemoryItem>;

/// Counters exposed through the cache inspection surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of entries held in memory.
    pub count: u64,
    /// Sum of the approximate sizes of all entries held in memory.
    pub approximate_size_bytes: u64,
}

/// Stores page configurations keyed by [`ResourceId`].
///
/// The store has a bounded in-memory layer with LRU eviction, and an optional on-disk layer
/// ([`FsCache`]) that survives restarts. On a memory miss the disk layer is consulted and the
/// entry is promoted back into memory.
///
/// All writes go through [`put`](Self::put), [`touch`](Self::touch) and
/// [`invalidate`](Self::invalidate). Writes for the same key are serialized by the in-memory
/// cache; writes for different keys never contend with each other.
#[derive(Clone)]
pub struct CacheStore {
    memory: InMemoryCache,
    fs: Option<FsCache>,
    /// Development mode: nothing is ever considered fresh.
    bypass: bool,
    /// Bumped by every [`invalidate`](CacheStore::invalidate).
    invalidations: Arc<AtomicU64>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("in-memory items", &self.memory.entry_count())
            .field("fs", &self.fs)
            .field("bypass", &self.bypass)
            .finish()
    }
}

impl CacheStore {
    /// Creates a memory-only store holding at most `in_memory_capacity` bytes.
    pub fn new(in_memory_capacity: u64) -> Self {
        let memory = InMemoryCache::builder()
            .name("pageconf")
            .max_capacity(in_memory_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(|_k, v: &InMemoryItem| v.weight)
            .build();

        Self {
            memory,
            fs: None,
            bypass: false,
            invalidations: Default::default(),
        }
    }

    pub fn from_config(config: &Config) -> io::Result<Self> {
        let mut store = Self::new(config.caches.in_memory_capacity).with_bypass(config.dev_mode);
        if let Some(fs) = FsCache::from_config(config)? {
            store = store.with_fs(fs);
        }
        Ok(store)
    }

    /// Persists entries to `fs` in addition to memory.
    pub fn with_fs(mut self, fs: FsCache) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Makes [`is_fresh`](Self::is_fresh) always return `false`.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn fs(&self) -> Option<&FsCache> {
        self.fs.as_ref()
    }

    /// Looks up the entry for `resource_id`.
    ///
    /// A concurrent write is either fully visible or not at all.
    pub fn get(&self, resource_id: &ResourceId) -> CacheContents<Option<Arc<CacheEntry>>> {
        let Some(fs) = &self.fs else {
            return Ok(self.memory.get(resource_id).map(|item| item.entry));
        };

        // Only inserts when the key is still vacant, so a concurrent `put` is never
        // overwritten by what was on disk before it. A file read while an invalidation
        // was running is not promoted.
        let epoch = self.invalidations.load(Ordering::Acquire);
        let mut error = None;
        let item = self
            .memory
            .entry_by_ref(resource_id)
            .or_optionally_insert_with(|| match fs.read(resource_id) {
                Ok(entry) => entry
                    .filter(|_| self.invalidations.load(Ordering::Acquire) == epoch)
                    .map(InMemoryItem::new),
                Err(err) => {
                    error = Some(err);
                    None
                }
            });

        match (item, error) {
            (Some(item), _) => Ok(Some(item.into_value().entry)),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(None),
        }
    }

    /// Stores `entry`, replacing any previous entry for the same resource.
    ///
    /// The in-memory entry is always replaced. An error means the disk layer could not be
    /// updated.
    pub fn put(&self, entry: CacheEntry) -> CacheContents {
        let item = InMemoryItem::new(entry);
        let mut result = Ok(());

        self.memory
            .entry(item.entry.resource_id.clone())
            .and_compute_with(|_| {
                if let Some(fs) = &self.fs {
                    result = fs.write(&item.entry);
                }
                Op::Put(item)
            });

        result
    }

    /// Marks `confirmed` as revalidated by the upstream, extending its lifetime by `ttl`.
    ///
    /// Only an entry that is still stored with the same ETag is refreshed. An entry replaced in
    /// the meantime is kept as is, and an invalidated one stays absent. Returns the stored entry,
    /// or the refreshed copy if nothing is stored.
    pub fn touch(
        &self,
        confirmed: &CacheEntry,
        ttl: Duration,
    ) -> (Arc<CacheEntry>, CacheContents) {
        let mut result = Ok(());
        let mut refreshed = None;

        let comp = self
            .memory
            .entry(confirmed.resource_id.clone())
            .and_compute_with(|current| match current {
                Some(current) if current.value().entry.etag == confirmed.etag => {
                    let item = InMemoryItem::new(confirmed.refreshed(SystemTime::now(), ttl));
                    if let Some(fs) = &self.fs {
                        result = fs.write(&item.entry);
                    }
                    refreshed = Some(item.entry.clone());
                    Op::Put(item)
                }
                _ => Op::Nop,
            });

        let stored = match comp {
            CompResult::Inserted(entry)
            | CompResult::ReplacedWith(entry)
            | CompResult::Unchanged(entry) => entry.into_value().entry,
            CompResult::Removed(_) | CompResult::StillNone(_) => refreshed
                .unwrap_or_else(|| Arc::new(confirmed.refreshed(SystemTime::now(), ttl))),
        };
        (stored, result)
    }

    /// Removes the entry for `resource_id`, or all entries if `None`.
    pub fn invalidate(&self, resource_id: Option<&ResourceId>) -> CacheContents {
        match resource_id {
            Some(resource_id) => {
                tracing::debug!("Invalidating cached config for `{}`", resource_id);
                // disk first, then the epoch, so a `get` that read the old file does not
                // promote it again
                let result = self.fs.as_ref().map_or(Ok(()), |fs| fs.remove(resource_id));
                self.invalidations.fetch_add(1, Ordering::AcqRel);
                self.memory.invalidate(resource_id);
                result
            }
            None => {
                tracing::debug!("Invalidating all cached configs");
                let result = self.fs.as_ref().map_or(Ok(()), FsCache::clear);
                self.invalidations.fetch_add(1, Ordering::AcqRel);
                self.memory.invalidate_all();
                result
            }
        }
    }

    /// Whether `entry` may be served without revalidation at `now`.
    pub fn is_fresh(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        !self.bypass && entry.is_fresh(now)
    }

    pub fn stats(&self) -> CacheStats {
        // entry counts are only updated lazily by moka
        self.memory.run_pending_tasks();
        CacheStats {
            count: self.memory.entry_count(),
            approximate_size_bytes: self.memory.weighted_size(),
        }
    }
}
