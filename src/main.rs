use campus_sync::backend::{BackendClient, ResourceRegistry};
use campus_sync::cache::{BlobStore, CacheStore, NoopStorage, SqliteStorage, SystemClock};
use campus_sync::config::Config;
use campus_sync::logging;
use campus_sync::sync::{Prefetcher, SyncManager, SyncOutcome};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "campus-sync")]
#[command(about = "Offline cache and background sync for the campus backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/campus-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the network as unavailable: no backend requests are made
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Prefetch critical resources, then sync on a timer until Ctrl-C
  Run,
  /// Run a single sync cycle
  Sync,
  /// Load resources into the cache (defaults to the configured list)
  Prefetch { resources: Vec<String> },
  /// Print cache statistics as JSON
  Stats,
  /// Remove expired entries
  ClearExpired,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let storage: Arc<dyn BlobStore> = if config.cache.persist {
    Arc::new(SqliteStorage::open(config.cache.path.as_deref())?)
  } else {
    Arc::new(NoopStorage)
  };
  let store = Arc::new(CacheStore::new(
    storage.clone(),
    Arc::new(SystemClock),
    config.cache.store_options(),
  ));

  match args.command {
    Command::Stats => print_json(&store.stats())?,
    Command::ClearExpired => println!("{}", store.clear_expired()),
    Command::Sync => {
      let manager = SyncManager::new(store, registry(&config)?, storage, config.sync.clone());
      manager.set_online(!args.offline);
      match manager.sync_now().await {
        SyncOutcome::Completed(report) => print_json(&report)?,
        SyncOutcome::Skipped(reason) => println!("sync skipped: {:?}", reason),
      }
    }
    Command::Prefetch { resources } => {
      if args.offline {
        return Err(eyre!("Cannot prefetch while offline"));
      }
      let resources = if resources.is_empty() {
        config.prefetch.resources.clone()
      } else {
        resources
      };
      let prefetcher = Prefetcher::new(
        store,
        registry(&config)?,
        config.prefetch.options(&config.cache, &config.sync),
      );
      print_json(&prefetcher.prefetch_critical(&resources[..]).await)?;
    }
    Command::Run => run(&config, store, storage, args.offline).await?,
  }

  Ok(())
}

async fn run(
  config: &Config,
  store: Arc<CacheStore>,
  storage: Arc<dyn BlobStore>,
  offline: bool,
) -> Result<()> {
  let registry = registry(config)?;
  let manager = SyncManager::new(store.clone(), registry.clone(), storage, config.sync.clone());
  manager.set_online(!offline);

  let prefetcher = Prefetcher::new(
    store,
    registry,
    config.prefetch.options(&config.cache, &manager.config()),
  );
  if manager.is_online() {
    prefetcher
      .prefetch_critical(&config.prefetch.resources[..])
      .await;
  }

  manager.start();
  info!("running, press Ctrl-C to stop");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  manager.stop();
  info!(metrics = ?manager.metrics(), "shutting down");
  Ok(())
}

fn registry(config: &Config) -> Result<Arc<ResourceRegistry>> {
  let client = BackendClient::new(config)?;
  Ok(Arc::new(client.registry()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", json);
  Ok(())
}
