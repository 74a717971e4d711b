//! Background maintenance of the cache: periodic sync and eager prefetch.

mod manager;
mod prefetch;

pub use manager::{
  ConflictResolution, SkipReason, SyncConfig, SyncManager, SyncMetrics, SyncOutcome, SyncReport,
  MAX_PERIOD_SECS, SYNC_CONFIG_KEY,
};
pub use prefetch::{PrefetchOptions, PrefetchReport, Prefetcher};
