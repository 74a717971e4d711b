//! Access to the hosted backend: the resource whitelist, the fetch registry,
//! and the HTTP client that serves it.

pub mod api_types;
mod cached_client;
mod client;
mod registry;
mod types;

pub use cached_client::CachedBackend;
pub use client::BackendClient;
pub use registry::{FetchFuture, ResourceRegistry};
pub use types::{FetchRequest, Record, ResourceType};
