//! Offline cache and background synchronization for the campus feedback and
//! wellness backend.
//!
//! - [`cache::CacheStore`] holds records durably with priority and expiry
//! - [`sync::Prefetcher`] warms critical resources on startup and reconnect
//! - [`sync::SyncManager`] refreshes stale entries on a timer

pub mod backend;
pub mod cache;
pub mod config;
pub mod logging;
pub mod sync;
