use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Collections the cache is allowed to hold.
///
/// Anything outside this list is rejected by name before it reaches the
/// cache or the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
  Feedback,
  Classes,
  Profiles,
  WellnessCheckins,
  Announcements,
  SecurityEvents,
}

impl ResourceType {
  pub const ALL: &'static [ResourceType] = &[
    ResourceType::Feedback,
    ResourceType::Classes,
    ResourceType::Profiles,
    ResourceType::WellnessCheckins,
    ResourceType::Announcements,
    ResourceType::SecurityEvents,
  ];

  /// Table name on the backend.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Feedback => "feedback",
      Self::Classes => "classes",
      Self::Profiles => "profiles",
      Self::WellnessCheckins => "wellness_checkins",
      Self::Announcements => "announcements",
      Self::SecurityEvents => "security_events",
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceType {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let name = s.trim().to_lowercase();
    Self::ALL
      .iter()
      .copied()
      .find(|rt| rt.as_str() == name)
      .ok_or_else(|| eyre!("Unsupported resource type: {}", s))
  }
}

/// A business record as returned by the backend.
///
/// The payload is opaque to the cache; only `id` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub data: serde_json::Value,
}

impl Record {
  pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }
}

/// A fetch scoped to one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub resource: ResourceType,
  /// Restrict to these record ids. `None` means the whole collection.
  pub ids: Option<Vec<String>>,
  pub limit: Option<usize>,
}

impl FetchRequest {
  pub fn all(resource: ResourceType) -> Self {
    Self {
      resource,
      ids: None,
      limit: None,
    }
  }

  pub fn with_ids(resource: ResourceType, ids: Vec<String>) -> Self {
    Self {
      resource,
      ids: Some(ids),
      limit: None,
    }
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}
