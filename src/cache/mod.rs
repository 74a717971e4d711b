//! Offline cache of backend records.
//!
//! This module provides a backend-agnostic cache that:
//! - Holds at most one entry per (resource type, record id)
//! - Bounds its size, evicting low priority and old entries first
//! - Derives freshness from expiry time and an explicit stale flag
//! - Persists the whole entry list to a blob store in one write

mod entry;
mod storage;
mod store;
mod traits;

pub use entry::{default_ttl, CacheEntry, Freshness, Priority, DEFAULT_TTL_SECS, MAX_TTL_SECS};
pub use storage::{BlobStore, MemoryStorage, NoopStorage, SqliteStorage};
pub use store::{CacheStats, CacheStore, PriorityCounts, StoreOptions, DEFAULT_CAPACITY, ENTRIES_KEY};
pub use traits::{CacheResult, CacheSource, Clock, ManualClock, SystemClock};
