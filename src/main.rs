use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::{Path, PathBuf};

use doorman::cache::{CacheStore, SqliteCacheStore};
use doorman::config::Config;
use doorman::event::{HostEvent, NullBridge};
use doorman::origin::OriginClient;
use doorman::queue::{OfflineQueue, QueueConfig, SqliteQueueStore};
use doorman::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "doorman")]
#[command(about = "Offline-resilience interception layer for a single-origin web application")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/doorman/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured manifest into a new static generation,
  /// activate it, and retire superseded generations
  Install,
  /// Drain the offline write queue once against the origin
  Replay,
  /// Show cache generations and queue counts
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _log_guard = init_tracing(&data_dir)?;

  match args.command {
    Command::Install => install(&config, &data_dir).await,
    Command::Replay => replay(&config, &data_dir).await,
    Command::Status => status(&config, &data_dir),
  }
}

/// Log to stderr and to a daily-rolling file under the data directory.
fn init_tracing(data_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

  let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "doorman.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  Ok(guard)
}

fn origin_client(config: &Config) -> Result<OriginClient> {
  OriginClient::new(&config.origin_url()?, &config.origin.write_endpoint)
}

fn queue_config(config: &Config) -> QueueConfig {
  QueueConfig {
    max_attempts: config.queue.max_attempts,
    backoff_base: std::time::Duration::from_millis(config.queue.backoff_base_ms),
    backoff_cap: std::time::Duration::from_millis(config.queue.backoff_cap_ms),
    wake_tag: config.queue.wake_tag.clone(),
  }
}

/// Run the install and activate lifecycle phases against the real origin.
async fn install(config: &Config, data_dir: &Path) -> Result<()> {
  let cache_store = SqliteCacheStore::open(&data_dir.join("cache.db"))?;
  let queue_store = SqliteQueueStore::open(&data_dir.join("queue.db"))?;
  let fetcher = origin_client(config)?;

  let mut worker = Worker::new(config, cache_store, queue_store, fetcher, NullBridge)?;

  worker.handle(HostEvent::Install).await?;
  worker.handle(HostEvent::Activate).await?;

  println!(
    "Installed and activated version {} ({} assets)",
    config.cache.version,
    config.cache.manifest.len()
  );

  Ok(())
}

/// Drain due pending writes once.
async fn replay(config: &Config, data_dir: &Path) -> Result<()> {
  let queue_store = SqliteQueueStore::open(&data_dir.join("queue.db"))?;
  let queue = OfflineQueue::new(queue_store, queue_config(config));
  let client = origin_client(config)?;

  let report = queue.replay(&client).await?;

  println!(
    "delivered: {}  deferred: {}  failed: {}",
    report.delivered.len(),
    report.deferred.len(),
    report.failed.len()
  );
  for write in &report.failed {
    println!("  failed permanently: {} (attempts: {})", write.id, write.attempts);
  }

  Ok(())
}

/// Show cache generations and queue state.
fn status(config: &Config, data_dir: &Path) -> Result<()> {
  let cache_store = SqliteCacheStore::open(&data_dir.join("cache.db"))?;
  let queue_store = SqliteQueueStore::open(&data_dir.join("queue.db"))?;
  let queue = OfflineQueue::new(queue_store, queue_config(config));

  println!("generations:");
  for name in cache_store.list_generations()? {
    println!("  {} ({} entries)", name, cache_store.count(&name)?);
  }

  let pending = queue.pending()?;
  let failed = queue.failed()?;
  println!("queue: {} pending, {} failed", pending.len(), failed.len());
  for write in &failed {
    println!(
      "  failed: {} created {} (attempts: {})",
      write.id, write.created_at, write.attempts
    );
  }

  Ok(())
}
