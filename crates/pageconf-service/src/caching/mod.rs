//! # Config caching infrastructure
//!
//! Page configurations are cached in two layers:
//!
//! - A bounded in-memory layer with LRU eviction, weighted by the approximate size of each
//!   entry ([`Config::caches`](crate::config::Config::caches)`.in_memory_capacity`).
//! - An optional file-system layer, gated by [`Config::cache_dir`](crate::config::Config::cache_dir),
//!   which persists entries across restarts.
//!
//! A lookup goes through memory first, and on a miss tries the file system, promoting the entry
//! back into memory. Writes always go to both layers.
//!
//! ## [`CacheEntry`]
//!
//! An entry holds a payload together with the ETag it was served with, when it was fetched and
//! how long it stays fresh. Entries are immutable; revalidating an entry creates a new one with
//! a new `fetched_at` ([`CacheStore::touch`]).
//!
//! ## [`CacheError`]
//!
//! Failures of the storage layer itself, such as an unreadable or corrupt cache file. These are
//! never surfaced to callers of the loader, which degrade to a cache miss instead.
//!
//! ## Cleanup
//!
//! The file-system layer is cleaned up by "time to idle": files whose `mtime` is older than
//! `caches.max_unused_for` are removed by [`cleanup`]. Files in use have their `mtime` bumped
//! once an hour.
//!
//! ### Metrics
//!
//! - `cache.error`: A storage operation failed, tagged by `op`.
//! - `cache.size.files` / `cache.size.bytes`: Files retained by the last cleanup.
//! - `cache.size.files_removed` / `cache.size.bytes_removed`: Files removed by the last cleanup.

mod cache_error;
mod cleanup;
mod entry;
mod fs;
mod resource_id;
mod store;

pub use cache_error::{CacheContents, CacheError};
pub use cleanup::{CleanupStats, cleanup};
pub use entry::CacheEntry;
pub use fs::FsCache;
pub use resource_id::ResourceId;
pub use store::{CacheStats, CacheStore};
