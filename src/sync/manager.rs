//! Background reconciliation of stale cache entries with the backend.
//!
//! A sync cycle:
//! 1. is skipped while offline, and while another cycle is still running
//! 2. collects every stale or expired entry and groups it by resource type
//! 3. orders the groups by their highest priority and keeps `batch_size` of them
//! 4. fetches each group's records by id and rewrites the group at high priority
//!
//! A failed group keeps its old entries and is retried on the next cycle.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{FetchRequest, Record, ResourceRegistry, ResourceType};
use crate::cache::{BlobStore, CacheStore, Priority};

/// Blob store key holding the persisted sync configuration.
pub const SYNC_CONFIG_KEY: &str = "sync_config";

/// Upper bound for the sync interval and the fetch timeout (one week).
pub const MAX_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

/// How a refreshed record is reconciled with the cached copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
  Client,
  /// The backend copy replaces the cached one
  #[default]
  Server,
  Merge,
}

impl ConflictResolution {
  /// Records to write back after a refresh.
  ///
  /// The cache never holds local edits, so every policy currently keeps the
  /// backend copy.
  pub fn resolve(self, remote: Vec<Record>) -> Vec<Record> {
    match self {
      Self::Server | Self::Client | Self::Merge => remote,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Run cycles on a timer. Manual cycles work either way.
  pub enable_batch_sync: bool,
  /// Maximum resource groups fetched per cycle
  pub batch_size: usize,
  pub sync_interval_secs: u64,
  /// Sync higher-priority groups first
  pub priority_based_sync: bool,
  pub conflict_resolution: ConflictResolution,
  /// Per-fetch timeout; a fetch that exceeds it counts as failed
  pub fetch_timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      enable_batch_sync: true,
      batch_size: 10,
      sync_interval_secs: 30,
      priority_based_sync: true,
      conflict_resolution: ConflictResolution::Server,
      fetch_timeout_secs: 30,
    }
  }
}

impl SyncConfig {
  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync_interval_secs)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn validate(&self) -> Result<()> {
    if self.batch_size == 0 {
      return Err(eyre!("sync.batch_size must be greater than zero"));
    }
    if !(1..=MAX_PERIOD_SECS).contains(&self.sync_interval_secs) {
      return Err(eyre!(
        "sync.sync_interval_secs must be between 1 and {}",
        MAX_PERIOD_SECS
      ));
    }
    if !(1..=MAX_PERIOD_SECS).contains(&self.fetch_timeout_secs) {
      return Err(eyre!(
        "sync.fetch_timeout_secs must be between 1 and {}",
        MAX_PERIOD_SECS
      ));
    }
    Ok(())
  }
}

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  AlreadyRunning,
  Offline,
}

/// Result of one sync trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed(SyncReport),
  Skipped(SkipReason),
}

/// What a completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Stale or expired entries found
  pub candidates: usize,
  /// Groups fetched this cycle, in fetch order
  pub selected: Vec<ResourceType>,
  /// Groups left for a later cycle by the batch limit
  pub deferred: usize,
  pub synced: usize,
  pub failed: usize,
  pub records_written: usize,
}

/// Counters across the manager's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
  pub cycles_completed: u64,
  pub cycles_skipped: u64,
  pub groups_synced: u64,
  pub groups_failed: u64,
  pub last_completed_at: Option<DateTime<Utc>>,
}

/// Stale entries of one resource type.
struct StaleGroup {
  resource: ResourceType,
  record_ids: Vec<String>,
  top_priority: Priority,
}

/// Periodically refreshes stale cache entries.
///
/// The timer is the only background task the manager owns; `start` replaces
/// it and `stop` cancels it, so two timers can never run for one manager.
pub struct SyncManager {
  inner: Arc<Inner>,
  timer: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
  store: Arc<CacheStore>,
  registry: Arc<ResourceRegistry>,
  storage: Arc<dyn BlobStore>,
  config: RwLock<SyncConfig>,
  running: AtomicBool,
  online: AtomicBool,
  metrics: Mutex<SyncMetrics>,
}

/// Clears the running flag when a cycle ends, including when it is cancelled.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl SyncManager {
  /// Create a manager. A previously persisted config takes precedence over
  /// `defaults`.
  pub fn new(
    store: Arc<CacheStore>,
    registry: Arc<ResourceRegistry>,
    storage: Arc<dyn BlobStore>,
    defaults: SyncConfig,
  ) -> Self {
    let config = match load_config(storage.as_ref()) {
      Ok(Some(config)) => {
        debug!(?config, "restored persisted sync config");
        config
      }
      Ok(None) => defaults,
      Err(e) => {
        warn!(error = %e, "ignoring persisted sync config");
        defaults
      }
    };

    Self {
      inner: Arc::new(Inner {
        store,
        registry,
        storage,
        config: RwLock::new(config),
        running: AtomicBool::new(false),
        online: AtomicBool::new(true),
        metrics: Mutex::new(SyncMetrics::default()),
      }),
      timer: Mutex::new(None),
    }
  }

  pub fn config(&self) -> SyncConfig {
    self.inner.config()
  }

  /// Replace the configuration, persist it, and restart the timer if it is
  /// running.
  pub fn update_config(&self, config: SyncConfig) -> Result<()> {
    config.validate()?;

    if let Err(e) = save_config(self.inner.storage.as_ref(), &config) {
      warn!(error = %e, "failed to persist sync config");
    }
    *self
      .inner
      .config
      .write()
      .unwrap_or_else(|e| e.into_inner()) = config;

    if self.is_started() {
      self.start();
    }
    Ok(())
  }

  /// Install the periodic timer, cancelling any existing one first.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn start(&self) {
    let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = timer.take() {
      handle.abort();
    }

    let config = self.inner.config();
    if !config.enable_batch_sync {
      info!("batch sync disabled, timer not started");
      return;
    }
    if let Err(e) = config.validate() {
      warn!(error = %e, "invalid sync config, timer not started");
      return;
    }

    let period = config.sync_interval();
    let first_tick = tokio::time::Instant::now() + period;
    let inner = self.inner.clone();
    *timer = Some(tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(first_tick, period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        inner.run_cycle().await;
      }
    }));
    info!(interval_secs = config.sync_interval_secs, "sync timer started");
  }

  /// Cancel the periodic timer.
  pub fn stop(&self) {
    let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = timer.take() {
      handle.abort();
      info!("sync timer stopped");
    }
  }

  pub fn is_started(&self) -> bool {
    self
      .timer
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Whether a cycle is in flight.
  pub fn is_syncing(&self) -> bool {
    self.inner.running.load(Ordering::Acquire)
  }

  /// Run one cycle now. A no-op while offline or while a cycle is running.
  pub async fn sync_now(&self) -> SyncOutcome {
    self.inner.run_cycle().await
  }

  /// Record connectivity. Returns `true` when this call brings the manager
  /// back online, so the caller can warm the cache again.
  pub fn set_online(&self, online: bool) -> bool {
    let was_online = self.inner.online.swap(online, Ordering::AcqRel);
    if was_online != online {
      info!(online, "connectivity changed");
    }
    online && !was_online
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::Acquire)
  }

  pub fn metrics(&self) -> SyncMetrics {
    self
      .inner
      .metrics
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}

impl Drop for SyncManager {
  fn drop(&mut self) {
    if let Some(handle) = self
      .timer
      .get_mut()
      .unwrap_or_else(|e| e.into_inner())
      .take()
    {
      handle.abort();
    }
  }
}

impl Inner {
  fn config(&self) -> SyncConfig {
    self
      .config
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  async fn run_cycle(&self) -> SyncOutcome {
    if !self.online.load(Ordering::Acquire) {
      debug!("offline, skipping sync cycle");
      self.record_skip();
      return SyncOutcome::Skipped(SkipReason::Offline);
    }

    if self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("sync cycle already running, dropping trigger");
      self.record_skip();
      return SyncOutcome::Skipped(SkipReason::AlreadyRunning);
    }
    let _guard = RunningGuard(&self.running);

    let report = self.reconcile(&self.config()).await;

    {
      let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
      metrics.cycles_completed += 1;
      metrics.groups_synced += report.synced as u64;
      metrics.groups_failed += report.failed as u64;
      metrics.last_completed_at = Some(self.store.now());
    }

    if report.selected.is_empty() {
      debug!("sync cycle found nothing to refresh");
    } else {
      info!(
        synced = report.synced,
        failed = report.failed,
        deferred = report.deferred,
        records = report.records_written,
        "sync cycle complete"
      );
    }
    SyncOutcome::Completed(report)
  }

  async fn reconcile(&self, config: &SyncConfig) -> SyncReport {
    let now = self.store.now();
    let entries = self.store.get_all();

    let mut report = SyncReport::default();
    let mut groups: Vec<StaleGroup> = Vec::new();
    for entry in entries.iter().filter(|e| e.freshness(now).needs_refresh()) {
      report.candidates += 1;
      match groups.iter_mut().find(|g| g.resource == entry.resource_type) {
        Some(group) => {
          group.record_ids.push(entry.record_id.clone());
          group.top_priority = group.top_priority.max(entry.priority);
        }
        None => groups.push(StaleGroup {
          resource: entry.resource_type,
          record_ids: vec![entry.record_id.clone()],
          top_priority: entry.priority,
        }),
      }
    }

    groups.retain(|group| {
      let supported = self.registry.supports(group.resource);
      if !supported {
        warn!(resource = %group.resource, "no fetcher registered, skipping resource");
      }
      supported
    });

    if config.priority_based_sync {
      groups.sort_by(|a, b| {
        b.top_priority
          .cmp(&a.top_priority)
          .then_with(|| a.resource.cmp(&b.resource))
      });
    } else {
      groups.sort_by_key(|g| g.resource);
    }

    report.deferred = groups.len().saturating_sub(config.batch_size);
    groups.truncate(config.batch_size);
    report.selected = groups.iter().map(|g| g.resource).collect();

    let fetches = groups.iter().map(|group| {
      let request = FetchRequest::with_ids(group.resource, group.record_ids.clone());
      debug!(resource = %group.resource, records = group.record_ids.len(), "syncing group");
      tokio::time::timeout(config.fetch_timeout(), self.registry.fetch(request))
    });
    let results = join_all(fetches).await;

    let ttl = self.store.options().default_ttl;
    for (group, result) in groups.iter().zip(results) {
      match result {
        Ok(Ok(records)) => {
          let records = config.conflict_resolution.resolve(records);
          let live = self
            .store
            .upsert_for_resource(group.resource, records, Priority::High, ttl);
          report.records_written += live;
          report.synced += 1;
        }
        Ok(Err(e)) => {
          warn!(resource = %group.resource, error = %e, "sync fetch failed, will retry");
          report.failed += 1;
        }
        Err(_) => {
          warn!(
            resource = %group.resource,
            timeout_secs = config.fetch_timeout_secs,
            "sync fetch timed out, will retry"
          );
          report.failed += 1;
        }
      }
    }

    report
  }

  fn record_skip(&self) {
    self
      .metrics
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .cycles_skipped += 1;
  }
}

fn load_config(storage: &dyn BlobStore) -> Result<Option<SyncConfig>> {
  let Some(data) = storage.get(SYNC_CONFIG_KEY)? else {
    return Ok(None);
  };
  let config: SyncConfig =
    serde_json::from_slice(&data).map_err(|e| eyre!("Failed to parse sync config: {}", e))?;
  config.validate()?;
  Ok(Some(config))
}

fn save_config(storage: &dyn BlobStore, config: &SyncConfig) -> Result<()> {
  let data =
    serde_json::to_vec(config).map_err(|e| eyre!("Failed to serialize sync config: {}", e))?;
  storage.set(SYNC_CONFIG_KEY, &data)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{default_ttl, Clock, Freshness, ManualClock, MemoryStorage, StoreOptions};
  use chrono::Duration as ChronoDuration;
  use serde_json::json;
  use std::collections::HashSet;
  use tokio::sync::Notify;

  /// Scriptable backend shared by every registered fetcher.
  #[derive(Default)]
  struct FakeBackend {
    requests: Mutex<Vec<FetchRequest>>,
    failing: Mutex<HashSet<ResourceType>>,
    /// When set, fetches wait for `release` after signalling `entered`
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
  }

  impl FakeBackend {
    fn fail(&self, resource: ResourceType) {
      self.failing.lock().unwrap().insert(resource);
    }

    fn requests(&self) -> Vec<FetchRequest> {
      self.requests.lock().unwrap().clone()
    }

    fn registry(self: &Arc<Self>) -> ResourceRegistry {
      let mut registry = ResourceRegistry::new();
      for resource in ResourceType::ALL {
        let backend = self.clone();
        registry.register(*resource, move |req: FetchRequest| {
          let backend = backend.clone();
          async move {
            backend.requests.lock().unwrap().push(req.clone());
            if let Some((entered, release)) = &backend.gate {
              entered.notify_one();
              release.notified().await;
            }
            if backend.failing.lock().unwrap().contains(&req.resource) {
              return Err(eyre!("{} unavailable", req.resource));
            }
            Ok(
              req
                .ids
                .unwrap_or_default()
                .into_iter()
                .map(|id| Record::new(id, json!({ "source": "remote" })))
                .collect::<Vec<_>>(),
            )
          }
        });
      }
      registry
    }
  }

  struct Fixture {
    clock: Arc<ManualClock>,
    storage: Arc<MemoryStorage>,
    store: Arc<CacheStore>,
    backend: Arc<FakeBackend>,
    manager: SyncManager,
  }

  fn fixture_with(backend: FakeBackend, config: SyncConfig) -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorage::new());
    let store = Arc::new(CacheStore::new(
      storage.clone(),
      clock.clone(),
      StoreOptions::default(),
    ));
    let backend = Arc::new(backend);
    let manager = SyncManager::new(
      store.clone(),
      Arc::new(backend.registry()),
      storage.clone(),
      config,
    );
    Fixture {
      clock,
      storage,
      store,
      backend,
      manager,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(FakeBackend::default(), SyncConfig::default())
  }

  fn seed(store: &CacheStore, resource: ResourceType, ids: &[&str], priority: Priority) {
    let records = ids
      .iter()
      .map(|id| Record::new(*id, json!({ "source": "cache" })))
      .collect();
    store.upsert_for_resource(resource, records, priority, default_ttl());
  }

  fn freshness(f: &Fixture, resource: ResourceType, id: &str) -> Freshness {
    f.store
      .get(resource, id)
      .unwrap()
      .freshness(f.clock.now())
  }

  #[tokio::test]
  async fn test_fresh_cache_needs_no_fetch() {
    let f = fixture();
    seed(&f.store, ResourceType::Feedback, &["1"], Priority::Low);

    let outcome = f.manager.sync_now().await;
    match outcome {
      SyncOutcome::Completed(report) => {
        assert_eq!(report.candidates, 0);
        assert!(report.selected.is_empty());
      }
      other => panic!("unexpected outcome {:?}", other),
    }
    assert!(f.backend.requests().is_empty());
  }

  #[tokio::test]
  async fn test_expired_entries_refreshed_at_high_priority() {
    let f = fixture();
    seed(&f.store, ResourceType::Feedback, &["1", "2"], Priority::Low);
    f.clock.advance(default_ttl());
    assert_eq!(freshness(&f, ResourceType::Feedback, "1"), Freshness::Expired);

    let outcome = f.manager.sync_now().await;
    let SyncOutcome::Completed(report) = outcome else {
      panic!("cycle skipped");
    };
    assert_eq!(report.candidates, 2);
    assert_eq!(report.synced, 1);
    assert_eq!(report.records_written, 2);

    for id in ["1", "2"] {
      let entry = f.store.get(ResourceType::Feedback, id).unwrap();
      assert_eq!(entry.freshness(f.clock.now()), Freshness::Fresh);
      assert_eq!(entry.priority, Priority::High);
      assert_eq!(entry.payload, json!({ "source": "remote" }));
    }
  }

  #[tokio::test]
  async fn test_fetch_is_scoped_to_stale_ids() {
    let f = fixture();
    seed(&f.store, ResourceType::Classes, &["a", "b", "c"], Priority::Medium);
    f.store.mark_stale(ResourceType::Classes);

    f.manager.sync_now().await;

    let requests = f.backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].resource, ResourceType::Classes);
    let ids: HashSet<String> = requests[0].ids.clone().unwrap().into_iter().collect();
    assert_eq!(
      ids,
      HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
    );
    assert_eq!(freshness(&f, ResourceType::Classes, "a"), Freshness::Fresh);
  }

  #[tokio::test]
  async fn test_offline_cycle_makes_no_requests() {
    let f = fixture();
    seed(&f.store, ResourceType::Feedback, &["1"], Priority::High);
    f.store.mark_stale(ResourceType::Feedback);
    let before = f.store.get_all();

    f.manager.set_online(false);
    let outcome = f.manager.sync_now().await;

    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Offline));
    assert!(f.backend.requests().is_empty());
    assert_eq!(f.store.get_all(), before);
    assert_eq!(freshness(&f, ResourceType::Feedback, "1"), Freshness::Stale);
    assert_eq!(f.manager.metrics().cycles_skipped, 1);
  }

  #[tokio::test]
  async fn test_set_online_reports_reconnect() {
    let f = fixture();
    assert!(!f.manager.set_online(true));
    assert!(!f.manager.set_online(false));
    assert!(!f.manager.set_online(false));
    assert!(f.manager.set_online(true));
    assert!(f.manager.is_online());
  }

  #[tokio::test]
  async fn test_failed_group_keeps_previous_state() {
    let f = fixture();
    seed(&f.store, ResourceType::Feedback, &["a1"], Priority::Medium);
    seed(&f.store, ResourceType::Classes, &["b1", "b2"], Priority::Low);
    f.clock.advance(default_ttl());
    f.backend.fail(ResourceType::Feedback);

    let SyncOutcome::Completed(report) = f.manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 1);

    let a = f.store.get(ResourceType::Feedback, "a1").unwrap();
    assert_eq!(a.freshness(f.clock.now()), Freshness::Expired);
    assert_eq!(a.priority, Priority::Medium);
    assert_eq!(a.payload, json!({ "source": "cache" }));

    for id in ["b1", "b2"] {
      let b = f.store.get(ResourceType::Classes, id).unwrap();
      assert_eq!(b.freshness(f.clock.now()), Freshness::Fresh);
      assert_eq!(b.priority, Priority::High);
    }

    let metrics = f.manager.metrics();
    assert_eq!(metrics.cycles_completed, 1);
    assert_eq!(metrics.groups_synced, 1);
    assert_eq!(metrics.groups_failed, 1);
    assert_eq!(metrics.last_completed_at, Some(f.clock.now()));
  }

  #[tokio::test]
  async fn test_batch_size_takes_highest_priority_groups() {
    let f = fixture_with(
      FakeBackend::default(),
      SyncConfig {
        batch_size: 2,
        ..SyncConfig::default()
      },
    );
    seed(&f.store, ResourceType::Feedback, &["f"], Priority::Low);
    seed(&f.store, ResourceType::Announcements, &["a"], Priority::High);
    seed(&f.store, ResourceType::Profiles, &["p"], Priority::Medium);
    f.clock.advance(default_ttl());

    let SyncOutcome::Completed(report) = f.manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(
      report.selected,
      vec![ResourceType::Announcements, ResourceType::Profiles]
    );
    assert_eq!(report.deferred, 1);
    assert_eq!(freshness(&f, ResourceType::Feedback, "f"), Freshness::Expired);

    // The deferred group goes next time
    let SyncOutcome::Completed(report) = f.manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(report.selected, vec![ResourceType::Feedback]);
    assert_eq!(freshness(&f, ResourceType::Feedback, "f"), Freshness::Fresh);
  }

  #[tokio::test]
  async fn test_group_priority_is_its_highest_entry() {
    let f = fixture_with(
      FakeBackend::default(),
      SyncConfig {
        batch_size: 1,
        ..SyncConfig::default()
      },
    );
    seed(&f.store, ResourceType::Feedback, &["f"], Priority::Medium);
    let now = f.clock.now();
    // Classes: one low entry and one high entry
    let mut entries: Vec<_> = f.store.get_all().to_vec();
    for (id, priority) in [("c-low", Priority::Low), ("c-high", Priority::High)] {
      entries.push(crate::cache::CacheEntry::new(
        ResourceType::Classes,
        Record::new(id, json!(null)),
        priority,
        default_ttl(),
        now,
      ));
    }
    f.store.replace_all(entries);
    f.clock.advance(default_ttl());

    let SyncOutcome::Completed(report) = f.manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(report.selected, vec![ResourceType::Classes]);
  }

  #[tokio::test]
  async fn test_priority_ordering_can_be_disabled() {
    let f = fixture_with(
      FakeBackend::default(),
      SyncConfig {
        batch_size: 1,
        priority_based_sync: false,
        ..SyncConfig::default()
      },
    );
    seed(&f.store, ResourceType::SecurityEvents, &["s"], Priority::High);
    seed(&f.store, ResourceType::Feedback, &["f"], Priority::Low);
    f.clock.advance(default_ttl());

    let SyncOutcome::Completed(report) = f.manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(report.selected, vec![ResourceType::Feedback]);
  }

  #[tokio::test]
  async fn test_trigger_while_running_is_dropped() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let backend = FakeBackend {
      gate: Some((entered.clone(), release.clone())),
      ..FakeBackend::default()
    };
    let f = fixture_with(backend, SyncConfig::default());
    seed(&f.store, ResourceType::Feedback, &["1"], Priority::Low);
    f.clock.advance(default_ttl());

    let manager = Arc::new(f.manager);
    let first = {
      let manager = manager.clone();
      tokio::spawn(async move { manager.sync_now().await })
    };
    entered.notified().await;
    assert!(manager.is_syncing());

    let before = f.store.get_all();
    let second = manager.sync_now().await;
    assert_eq!(second, SyncOutcome::Skipped(SkipReason::AlreadyRunning));
    assert_eq!(f.store.get_all(), before);
    assert_eq!(f.backend.requests().len(), 1);

    release.notify_one();
    let first = first.await.unwrap();
    assert!(matches!(first, SyncOutcome::Completed(ref r) if r.synced == 1));
    assert!(!manager.is_syncing());
    assert_eq!(freshness_in(&f.store, &f.clock), Freshness::Fresh);
  }

  fn freshness_in(store: &CacheStore, clock: &ManualClock) -> Freshness {
    store
      .get(ResourceType::Feedback, "1")
      .unwrap()
      .freshness(clock.now())
  }

  #[tokio::test]
  async fn test_cancelled_cycle_releases_guard() {
    let entered = Arc::new(Notify::new());
    let backend = FakeBackend {
      gate: Some((entered.clone(), Arc::new(Notify::new()))),
      ..FakeBackend::default()
    };
    let f = fixture_with(backend, SyncConfig::default());
    seed(&f.store, ResourceType::Feedback, &["1"], Priority::Low);
    f.clock.advance(default_ttl());

    let manager = Arc::new(f.manager);
    let stuck = {
      let manager = manager.clone();
      tokio::spawn(async move { manager.sync_now().await })
    };
    entered.notified().await;
    stuck.abort();
    let _ = stuck.await;

    assert!(!manager.is_syncing());
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_fetch_times_out() {
    let entered = Arc::new(Notify::new());
    let backend = FakeBackend {
      gate: Some((entered, Arc::new(Notify::new()))),
      ..FakeBackend::default()
    };
    let f = fixture_with(
      backend,
      SyncConfig {
        fetch_timeout_secs: 5,
        ..SyncConfig::default()
      },
    );
    seed(&f.store, ResourceType::Feedback, &["1"], Priority::Low);
    f.clock.advance(default_ttl());

    let SyncOutcome::Completed(report) = f.manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(report.failed, 1);
    assert!(!f.manager.is_syncing());
  }

  #[tokio::test(start_paused = true)]
  async fn test_timer_runs_cycles_until_stopped() {
    let f = fixture();
    seed(&f.store, ResourceType::Feedback, &["1"], Priority::Low);
    f.store.mark_stale(ResourceType::Feedback);

    f.manager.start();
    assert!(f.manager.is_started());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(f.backend.requests().len(), 1);
    assert_eq!(f.manager.metrics().cycles_completed, 1);

    f.manager.stop();
    assert!(!f.manager.is_started());
    f.store.mark_stale(ResourceType::Feedback);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(f.backend.requests().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_restart_keeps_a_single_timer() {
    let f = fixture();
    f.manager.start();
    f.manager.start();
    f.manager.start();

    tokio::time::sleep(Duration::from_secs(95)).await;
    // One timer ticking at 30s, 60s, 90s
    assert_eq!(f.manager.metrics().cycles_completed, 3);
  }

  #[tokio::test]
  async fn test_out_of_range_periods_are_rejected() {
    for config in [
      SyncConfig {
        sync_interval_secs: u64::MAX,
        ..SyncConfig::default()
      },
      SyncConfig {
        fetch_timeout_secs: MAX_PERIOD_SECS + 1,
        ..SyncConfig::default()
      },
    ] {
      assert!(config.validate().is_err());
    }
    assert!(SyncConfig {
      sync_interval_secs: MAX_PERIOD_SECS,
      fetch_timeout_secs: MAX_PERIOD_SECS,
      ..SyncConfig::default()
    }
    .validate()
    .is_ok());
  }

  #[tokio::test]
  async fn test_huge_interval_does_not_start_a_dead_timer() {
    let f = fixture_with(
      FakeBackend::default(),
      SyncConfig {
        sync_interval_secs: u64::MAX,
        ..SyncConfig::default()
      },
    );

    f.manager.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!f.manager.is_started());

    // Manual cycles still work, and a valid config brings the timer up
    assert!(matches!(f.manager.sync_now().await, SyncOutcome::Completed(_)));
    f.manager.update_config(SyncConfig::default()).unwrap();
    f.manager.start();
    assert!(f.manager.is_started());
  }

  #[tokio::test]
  async fn test_disabled_batch_sync_installs_no_timer() {
    let f = fixture_with(
      FakeBackend::default(),
      SyncConfig {
        enable_batch_sync: false,
        ..SyncConfig::default()
      },
    );
    f.manager.start();
    assert!(!f.manager.is_started());
    assert!(matches!(f.manager.sync_now().await, SyncOutcome::Completed(_)));
  }

  #[tokio::test]
  async fn test_update_config_persists_and_restores() {
    let f = fixture();
    let updated = SyncConfig {
      batch_size: 4,
      sync_interval_secs: 60,
      conflict_resolution: ConflictResolution::Client,
      ..SyncConfig::default()
    };

    f.manager.start();
    f.manager.update_config(updated.clone()).unwrap();
    assert_eq!(f.manager.config(), updated);
    assert!(f.manager.is_started());

    let restored = SyncManager::new(
      f.store.clone(),
      Arc::new(f.backend.registry()),
      f.storage.clone(),
      SyncConfig::default(),
    );
    assert_eq!(restored.config(), updated);

    assert!(f
      .manager
      .update_config(SyncConfig {
        batch_size: 0,
        ..SyncConfig::default()
      })
      .is_err());
    assert_eq!(f.manager.config(), updated);
  }

  #[tokio::test]
  async fn test_corrupt_persisted_config_falls_back_to_defaults() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(SYNC_CONFIG_KEY, b"{\"batch_size\": 0}").unwrap();
    let store = Arc::new(CacheStore::new(
      storage.clone(),
      Arc::new(ManualClock::new(Utc::now())),
      StoreOptions::default(),
    ));

    let manager = SyncManager::new(
      store,
      Arc::new(ResourceRegistry::new()),
      storage,
      SyncConfig::default(),
    );
    assert_eq!(manager.config(), SyncConfig::default());
  }

  #[tokio::test]
  async fn test_unregistered_resource_is_skipped() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(CacheStore::new(
      Arc::new(MemoryStorage::new()),
      clock.clone(),
      StoreOptions::default(),
    ));
    seed(&store, ResourceType::Profiles, &["p"], Priority::High);
    clock.advance(ChronoDuration::days(2));

    let manager = SyncManager::new(
      store.clone(),
      Arc::new(ResourceRegistry::new()),
      Arc::new(MemoryStorage::new()),
      SyncConfig::default(),
    );
    let SyncOutcome::Completed(report) = manager.sync_now().await else {
      panic!("cycle skipped");
    };
    assert_eq!(report.candidates, 1);
    assert!(report.selected.is_empty());
    assert_eq!(store.get_all().len(), 1);
  }

  #[test]
  fn test_conflict_policies_keep_remote_copy() {
    let remote = vec![Record::new("1", json!({ "v": 2 }))];
    for policy in [
      ConflictResolution::Client,
      ConflictResolution::Server,
      ConflictResolution::Merge,
    ] {
      assert_eq!(policy.resolve(remote.clone()), remote);
    }
  }
}
