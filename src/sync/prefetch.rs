//! Eager warm-up of critical resources on startup or reconnect.

use chrono::Duration;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::backend::{FetchRequest, ResourceRegistry, ResourceType};
use crate::cache::{default_ttl, CacheStore, Priority};

#[derive(Debug, Clone)]
pub struct PrefetchOptions {
  /// Maximum records fetched per resource
  pub limit: usize,
  pub ttl: Duration,
  pub fetch_timeout: StdDuration,
}

impl Default for PrefetchOptions {
  fn default() -> Self {
    Self {
      limit: 100,
      ttl: default_ttl(),
      fetch_timeout: StdDuration::from_secs(30),
    }
  }
}

/// What a prefetch pass did, per requested name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
  pub loaded: Vec<ResourceType>,
  pub failed: Vec<ResourceType>,
  /// Names that are not supported resource types, or have no fetcher
  pub skipped: Vec<String>,
}

/// Loads a whitelist of resources into the cache at high priority.
pub struct Prefetcher {
  store: Arc<CacheStore>,
  registry: Arc<ResourceRegistry>,
  options: PrefetchOptions,
}

impl Prefetcher {
  pub fn new(
    store: Arc<CacheStore>,
    registry: Arc<ResourceRegistry>,
    options: PrefetchOptions,
  ) -> Self {
    Self {
      store,
      registry,
      options,
    }
  }

  /// Fetch and cache each named resource.
  ///
  /// Unknown names are skipped with a warning, and one resource failing does
  /// not stop the others. Nothing is returned as an error.
  pub async fn prefetch_critical<S: AsRef<str>>(&self, resource_types: &[S]) -> PrefetchReport {
    let mut report = PrefetchReport::default();
    let mut wanted: Vec<ResourceType> = Vec::new();

    for name in resource_types {
      let name = name.as_ref();
      match name.parse::<ResourceType>() {
        Ok(rt) if self.registry.supports(rt) => {
          if !wanted.contains(&rt) {
            wanted.push(rt);
          }
        }
        Ok(rt) => {
          warn!(resource = %rt, "no fetcher registered, skipping prefetch");
          report.skipped.push(name.to_string());
        }
        Err(e) => {
          warn!(resource = name, error = %e, "skipping prefetch of unsupported resource");
          report.skipped.push(name.to_string());
        }
      }
    }

    let fetches = wanted.iter().map(|rt| {
      let request = FetchRequest::all(*rt).limit(self.options.limit);
      tokio::time::timeout(self.options.fetch_timeout, self.registry.fetch(request))
    });
    let results = join_all(fetches).await;

    for (rt, result) in wanted.into_iter().zip(results) {
      match result {
        Ok(Ok(records)) => {
          let count = records.len();
          self
            .store
            .upsert_for_resource(rt, records, Priority::High, self.options.ttl);
          info!(resource = %rt, count, "prefetched resource");
          report.loaded.push(rt);
        }
        Ok(Err(e)) => {
          warn!(resource = %rt, error = %e, "prefetch failed");
          report.failed.push(rt);
        }
        Err(_) => {
          warn!(resource = %rt, "prefetch timed out");
          report.failed.push(rt);
        }
      }
    }

    report
  }
}
