//! Resource type → fetch function table.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::types::{FetchRequest, Record, ResourceType};

/// A boxed future resolving to fetched records.
pub type FetchFuture = BoxFuture<'static, Result<Vec<Record>>>;

/// A shareable fetch function for one resource type.
type FetchFn = Arc<dyn Fn(FetchRequest) -> FetchFuture + Send + Sync>;

/// Maps each supported resource type to the function that fetches it.
///
/// Adding a resource type to the cache means registering a fetcher here;
/// the sync manager and prefetcher dispatch through this table only.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
  fetchers: HashMap<ResourceType, FetchFn>,
}

impl ResourceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register (or replace) the fetcher for `resource`.
  pub fn register<F, Fut>(&mut self, resource: ResourceType, fetcher: F) -> &mut Self
  where
    F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Record>>> + Send + 'static,
  {
    let fetcher: FetchFn = Arc::new(move |req| -> FetchFuture { Box::pin(fetcher(req)) });
    self.fetchers.insert(resource, fetcher);
    self
  }

  pub fn supports(&self, resource: ResourceType) -> bool {
    self.fetchers.contains_key(&resource)
  }

  /// Registered resource types, in whitelist order.
  pub fn resource_types(&self) -> Vec<ResourceType> {
    ResourceType::ALL
      .iter()
      .copied()
      .filter(|rt| self.supports(*rt))
      .collect()
  }

  /// Fetch records for a request.
  pub async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>> {
    let fetcher = self
      .fetchers
      .get(&request.resource)
      .cloned()
      .ok_or_else(|| eyre!("No fetcher registered for {}", request.resource))?;
    fetcher(request).await
  }
}

impl std::fmt::Debug for ResourceRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceRegistry")
      .field("resources", &self.resource_types())
      .finish()
  }
}
