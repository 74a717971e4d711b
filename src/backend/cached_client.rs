//! Read-through access to the backend for UI readers.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::warn;

use crate::cache::{CacheResult, CacheStore, Priority};

use super::registry::ResourceRegistry;
use super::types::{FetchRequest, Record, ResourceType};

/// Backend access with transparent caching.
///
/// Reads go to the cache first and fall back to the backend when the cached
/// copy is missing or not fresh. Records fetched here are cached at medium
/// priority unless the resource was already cached higher; the prefetcher and
/// sync manager promote what matters to high.
#[derive(Clone)]
pub struct CachedBackend {
  store: Arc<CacheStore>,
  registry: Arc<ResourceRegistry>,
  fetch_timeout: StdDuration,
  limit: Option<usize>,
}

impl CachedBackend {
  pub fn new(store: Arc<CacheStore>, registry: Arc<ResourceRegistry>) -> Self {
    Self {
      store,
      registry,
      fetch_timeout: StdDuration::from_secs(30),
      limit: None,
    }
  }

  pub fn with_fetch_timeout(mut self, timeout: StdDuration) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  /// Cap the rows fetched per refresh.
  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// List a resource with a cache-first strategy.
  ///
  /// 1. If every cached entry for the resource is fresh, return them
  /// 2. Otherwise fetch from the backend and rewrite the cache
  /// 3. On backend failure, serve whatever is cached (offline mode)
  /// 4. With nothing cached, the backend error is returned
  pub async fn list(&self, resource: ResourceType) -> Result<CacheResult<Vec<Record>>> {
    let now = self.store.now();
    let cached = self.store.get_resource(resource);
    let oldest = cached.iter().map(|e| e.cached_at).min();

    if let Some(cached_at) = oldest {
      if cached.iter().all(|e| !e.freshness(now).needs_refresh()) {
        let records = cached.iter().map(|entry| entry.to_record()).collect();
        return Ok(CacheResult::from_cache(records, cached_at));
      }
    }

    let mut request = FetchRequest::all(resource);
    if let Some(limit) = self.limit {
      request = request.limit(limit);
    }
    let fetched = tokio::time::timeout(self.fetch_timeout, self.registry.fetch(request))
      .await
      .unwrap_or_else(|_| Err(eyre!("Timed out fetching {}", resource)));

    match fetched {
      Ok(records) => {
        let ttl = self.store.options().default_ttl;
        let priority = cached
          .iter()
          .map(|e| e.priority)
          .fold(Priority::Medium, Priority::max);
        self
          .store
          .upsert_for_resource(resource, records.clone(), priority, ttl);
        Ok(CacheResult::from_network(records))
      }
      Err(e) => match oldest {
        Some(cached_at) => {
          warn!(resource = %resource, error = %e, "backend fetch failed, serving cached data");
          let records = cached.iter().map(|entry| entry.to_record()).collect();
          Ok(CacheResult::offline(records, cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Tell the cache that `resource` changed remotely.
  ///
  /// Its entries are flagged stale and refreshed by the next sync cycle.
  pub fn invalidate(&self, resource: ResourceType) -> usize {
    self.store.mark_stale(resource)
  }
}
