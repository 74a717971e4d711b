//! Bounded, persistent store of cache entries.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use super::entry::{default_ttl, CacheEntry, Freshness, Priority};
use super::storage::BlobStore;
use super::traits::Clock;
use crate::backend::{Record, ResourceType};

/// Blob store key holding the serialized entry list.
pub const ENTRIES_KEY: &str = "offline_cache.entries";

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// Maximum number of live entries.
  pub capacity: usize,
  pub default_ttl: Duration,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_CAPACITY,
      default_ttl: default_ttl(),
    }
  }
}

/// Entry counts per priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
  pub high: usize,
  pub medium: usize,
  pub low: usize,
}

/// Diagnostic snapshot of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub total: usize,
  pub fresh: usize,
  pub stale: usize,
  pub expired: usize,
  pub by_priority: PriorityCounts,
  /// Size of the serialized entry list.
  pub size_bytes: usize,
  pub oldest: Option<DateTime<Utc>>,
  pub newest: Option<DateTime<Utc>>,
}

/// Durable, capacity-bounded cache of records.
///
/// Readers get an immutable snapshot of the entry list; writers build a new
/// list and swap it in, so a reader sees either the old set or the new one.
/// Writers are serialized against each other. Storage failures are logged and
/// never returned: the cache is an accelerator, callers can always go to the
/// backend instead.
pub struct CacheStore {
  storage: Arc<dyn BlobStore>,
  clock: Arc<dyn Clock>,
  options: StoreOptions,
  snapshot: RwLock<Arc<Vec<CacheEntry>>>,
  writer: Mutex<()>,
}

impl CacheStore {
  /// Create a store and load whatever was persisted last time.
  pub fn new(storage: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, options: StoreOptions) -> Self {
    let store = Self {
      storage,
      clock,
      options,
      snapshot: RwLock::new(Arc::new(Vec::new())),
      writer: Mutex::new(()),
    };

    let loaded = match store.load() {
      Ok(entries) => entries,
      Err(e) => {
        warn!(error = %e, "failed to load cached entries, starting empty");
        Vec::new()
      }
    };
    let loaded = store.bound(loaded);
    debug!(count = loaded.len(), "loaded cached entries");
    store.install(Arc::new(loaded));

    store
  }

  pub fn options(&self) -> &StoreOptions {
    &self.options
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Every live entry, highest priority first.
  pub fn get_all(&self) -> Arc<Vec<CacheEntry>> {
    self
      .snapshot
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Look up one record.
  pub fn get(&self, resource_type: ResourceType, record_id: &str) -> Option<CacheEntry> {
    self
      .get_all()
      .iter()
      .find(|e| e.resource_type == resource_type && e.record_id == record_id)
      .cloned()
  }

  /// All cached entries of one resource type.
  pub fn get_resource(&self, resource_type: ResourceType) -> Vec<CacheEntry> {
    self
      .get_all()
      .iter()
      .filter(|e| e.resource_type == resource_type)
      .cloned()
      .collect()
  }

  /// Replace the whole entry set.
  ///
  /// Entries over capacity are dropped lowest priority first, then oldest
  /// first. This is backpressure, not an error.
  pub fn replace_all(&self, entries: Vec<CacheEntry>) {
    let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
    self.commit(entries);
  }

  /// Replace every entry of `resource_type` with entries for `records`.
  ///
  /// Returns how many entries of that type are live afterwards.
  pub fn upsert_for_resource(
    &self,
    resource_type: ResourceType,
    records: Vec<Record>,
    priority: Priority,
    ttl: Duration,
  ) -> usize {
    let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
    let now = self.clock.now();

    let mut entries: Vec<CacheEntry> = self
      .get_all()
      .iter()
      .filter(|e| e.resource_type != resource_type)
      .cloned()
      .collect();
    let written = records.len();
    entries.extend(
      records
        .into_iter()
        .map(|record| CacheEntry::new(resource_type, record, priority, ttl, now)),
    );

    let committed = self.commit(entries);
    let live = committed
      .iter()
      .filter(|e| e.resource_type == resource_type)
      .count();
    debug!(resource = %resource_type, written, live, ?priority, "upserted resource");
    live
  }

  /// Flag every entry of `resource_type` for refresh on the next sync.
  pub fn mark_stale(&self, resource_type: ResourceType) -> usize {
    let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

    let mut flagged = 0;
    let entries: Vec<CacheEntry> = self
      .get_all()
      .iter()
      .map(|e| {
        if e.resource_type == resource_type && !e.stale {
          flagged += 1;
          e.flagged_stale()
        } else {
          e.clone()
        }
      })
      .collect();

    if flagged > 0 {
      self.commit(entries);
    }
    flagged
  }

  /// Remove expired entries. Returns how many were removed.
  pub fn clear_expired(&self) -> usize {
    let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
    let now = self.clock.now();

    let current = self.get_all();
    let kept: Vec<CacheEntry> = current
      .iter()
      .filter(|e| !e.is_expired(now))
      .cloned()
      .collect();
    let removed = current.len() - kept.len();

    if removed > 0 {
      self.commit(kept);
      debug!(removed, "cleared expired entries");
    }
    removed
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self.get_all();
    let now = self.clock.now();
    let mut stats = CacheStats {
      total: entries.len(),
      size_bytes: serde_json::to_vec(entries.as_slice())
        .map(|b| b.len())
        .unwrap_or(0),
      ..CacheStats::default()
    };

    for entry in entries.iter() {
      match entry.freshness(now) {
        Freshness::Fresh => stats.fresh += 1,
        Freshness::Stale => stats.stale += 1,
        Freshness::Expired => stats.expired += 1,
      }
      match entry.priority {
        Priority::High => stats.by_priority.high += 1,
        Priority::Medium => stats.by_priority.medium += 1,
        Priority::Low => stats.by_priority.low += 1,
      }
      stats.oldest = Some(stats.oldest.map_or(entry.cached_at, |t| t.min(entry.cached_at)));
      stats.newest = Some(stats.newest.map_or(entry.cached_at, |t| t.max(entry.cached_at)));
    }

    stats
  }

  /// Bound, persist and publish a new entry set. Caller holds the writer lock.
  fn commit(&self, entries: Vec<CacheEntry>) -> Arc<Vec<CacheEntry>> {
    let entries = Arc::new(self.bound(entries));

    match self.persist(&entries) {
      Ok(()) => {}
      Err(e) => warn!(error = %e, "failed to persist cache entries"),
    }

    self.install(entries.clone());
    entries
  }

  /// Apply the single-entry-per-record rule and the capacity bound.
  fn bound(&self, entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
    // Later writes supersede earlier ones for the same record
    let mut seen = HashSet::new();
    let mut live: Vec<CacheEntry> = entries
      .into_iter()
      .rev()
      .filter(|e| seen.insert((e.resource_type, e.record_id.clone())))
      .collect();
    live.reverse();

    // Total order, so a persisted list reloads in the same order
    live.sort_by(|a, b| {
      b.priority
        .cmp(&a.priority)
        .then_with(|| b.cached_at.cmp(&a.cached_at))
        .then_with(|| a.resource_type.cmp(&b.resource_type))
        .then_with(|| a.record_id.cmp(&b.record_id))
    });

    if live.len() > self.options.capacity {
      debug!(
        dropped = live.len() - self.options.capacity,
        capacity = self.options.capacity,
        "cache over capacity, dropping lowest priority entries"
      );
      live.truncate(self.options.capacity);
    }

    live
  }

  fn persist(&self, entries: &[CacheEntry]) -> Result<()> {
    let data =
      serde_json::to_vec(entries).map_err(|e| eyre!("Failed to serialize entries: {}", e))?;
    self.storage.set(ENTRIES_KEY, &data)
  }

  fn load(&self) -> Result<Vec<CacheEntry>> {
    match self.storage.get(ENTRIES_KEY)? {
      Some(data) => {
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize entries: {}", e))
      }
      None => Ok(Vec::new()),
    }
  }

  fn install(&self, entries: Arc<Vec<CacheEntry>>) {
    *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = entries;
  }
}
