//! Cache entries and the metadata derived from them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::{Record, ResourceType};

/// Default time-to-live for cached records, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

/// Largest configurable time-to-live (100 years), in seconds.
pub const MAX_TTL_SECS: i64 = 100 * 365 * DEFAULT_TTL_SECS;

pub fn default_ttl() -> Duration {
  Duration::seconds(DEFAULT_TTL_SECS)
}

/// Eviction and sync weight. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
}

/// Derived freshness of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
  Fresh,
  Stale,
  Expired,
}

impl Freshness {
  pub fn needs_refresh(&self) -> bool {
    !matches!(self, Freshness::Fresh)
  }
}

/// A single cached record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub id: String,
  pub resource_type: ResourceType,
  pub record_id: String,
  pub payload: serde_json::Value,
  pub cached_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub priority: Priority,
  /// Set when the resource was invalidated but not yet refreshed.
  #[serde(default)]
  pub stale: bool,
}

impl CacheEntry {
  /// Build an entry for a record written at `now`.
  pub fn new(
    resource_type: ResourceType,
    record: Record,
    priority: Priority,
    ttl: Duration,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: entry_id(resource_type, &record.id, now),
      resource_type,
      record_id: record.id,
      payload: record.data,
      cached_at: now,
      expires_at: now
        .checked_add_signed(ttl.min(Duration::seconds(MAX_TTL_SECS)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
      priority,
      stale: false,
    }
  }

  pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
    if now >= self.expires_at {
      Freshness::Expired
    } else if self.stale {
      Freshness::Stale
    } else {
      Freshness::Fresh
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }

  /// Copy of this entry flagged for refresh.
  pub fn flagged_stale(&self) -> Self {
    Self {
      stale: true,
      ..self.clone()
    }
  }

  pub fn to_record(&self) -> Record {
    Record::new(self.record_id.clone(), self.payload.clone())
  }
}

/// Stable id for a write of `record_id` at `written_at`.
fn entry_id(resource_type: ResourceType, record_id: &str, written_at: DateTime<Utc>) -> String {
  let input = format!(
    "{}:{}:{}",
    resource_type.as_str(),
    record_id,
    written_at.timestamp_millis()
  );

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(&hasher.finalize()[..16])
}
