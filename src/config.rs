use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::ResourceType;
use crate::cache::{StoreOptions, DEFAULT_CAPACITY, DEFAULT_TTL_SECS, MAX_TTL_SECS};
use crate::sync::{PrefetchOptions, SyncConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Defaults for the sync manager; a config persisted at runtime wins.
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub prefetch: PrefetchConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend, e.g. https://abc.supabase.co
  pub url: String,
  /// Postgres schema to read from (defaults to the backend's public schema)
  #[serde(default)]
  pub schema: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/campus-sync/cache.db)
  pub path: Option<PathBuf>,
  /// When false the cache lives only in memory
  #[serde(default = "default_true")]
  pub persist: bool,
  #[serde(default = "default_capacity")]
  pub capacity: usize,
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      persist: true,
      capacity: DEFAULT_CAPACITY,
      default_ttl_secs: DEFAULT_TTL_SECS,
    }
  }
}

impl CacheConfig {
  pub fn store_options(&self) -> StoreOptions {
    StoreOptions {
      capacity: self.capacity,
      default_ttl: chrono::Duration::seconds(self.default_ttl_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchConfig {
  /// Resource names to warm on startup (defaults to every supported type)
  #[serde(default = "default_prefetch_resources")]
  pub resources: Vec<String>,
  #[serde(default = "default_prefetch_limit")]
  pub limit: usize,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      resources: default_prefetch_resources(),
      limit: default_prefetch_limit(),
    }
  }
}

impl PrefetchConfig {
  pub fn options(&self, cache: &CacheConfig, sync: &SyncConfig) -> PrefetchOptions {
    PrefetchOptions {
      limit: self.limit,
      ttl: chrono::Duration::seconds(cache.default_ttl_secs),
      fetch_timeout: sync.fetch_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Write logs to daily files in this directory instead of stderr
  pub directory: Option<PathBuf>,
  #[serde(default = "default_log_prefix")]
  pub file_prefix: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      directory: None,
      file_prefix: default_log_prefix(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_capacity() -> usize {
  DEFAULT_CAPACITY
}

fn default_ttl_secs() -> i64 {
  DEFAULT_TTL_SECS
}

fn default_prefetch_resources() -> Vec<String> {
  ResourceType::ALL
    .iter()
    .map(|rt| rt.as_str().to_string())
    .collect()
}

fn default_prefetch_limit() -> usize {
  100
}

fn default_log_prefix() -> String {
  "campus-sync.log".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./campus-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/campus-sync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/campus-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("campus-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("campus-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.capacity == 0 {
      return Err(eyre!("cache.capacity must be greater than zero"));
    }
    if !(0..=MAX_TTL_SECS).contains(&self.cache.default_ttl_secs) {
      return Err(eyre!(
        "cache.default_ttl_secs must be between 0 and {}",
        MAX_TTL_SECS
      ));
    }
    self.sync.validate()
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks CAMPUS_SYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("CAMPUS_SYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set CAMPUS_SYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
