use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::{StreamExt, TryStreamExt};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use optisync::{Config, HttpTransport, SqliteStore, SyncEngine};

/// Concurrent fetches issued by `get`.
const FETCH_CONCURRENCY: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "optisync")]
#[command(about = "Inspect and drain the offline sync queue of the optical shop client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/optisync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the server as unreachable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connectivity, pending operations and cached keys
  Status,
  /// Print the pending operation queue
  Queue,
  /// Replay queued operations once
  Drain,
  /// Fetch resources, each given as PATH or KEY=PATH to refresh a cache key
  Get {
    #[arg(required = true)]
    targets: Vec<String>,
  },
  /// Print a cached snapshot
  Cache { key: String },
}

/// Split `KEY=PATH` into its parts; a bare `PATH` has no cache key.
fn parse_target(target: &str) -> (Option<&str>, &str) {
  match target.split_once('=') {
    Some((key, path)) if !key.is_empty() && !key.starts_with('/') => (Some(key), path),
    _ => (None, target),
  }
}

fn log_dir(config: &Config) -> Result<PathBuf> {
  let db = match &config.storage.path {
    Some(path) => path.clone(),
    None => SqliteStore::default_path()?,
  };
  Ok(
    db.parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."))
      .join("logs"),
  )
}

fn init_logging(dir: &Path) -> WorkerGuard {
  let appender = tracing_appender::rolling::daily(dir, "optisync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("OPTISYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  guard
}

fn print(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn fetch_all(
  engine: &SyncEngine<SqliteStore, HttpTransport>,
  targets: &[String],
) -> Result<Value> {
  let results: Vec<(String, Option<Value>)> = futures::stream::iter(targets.iter().map(|t| parse_target(t)))
    .map(|(key, path)| async move {
      let value = engine.fetch_resource(path, key).await?;
      Ok::<_, optisync::SyncError>((path.to_string(), value))
    })
    .buffered(FETCH_CONCURRENCY)
    .try_collect()
    .await?;

  let map: Map<String, Value> = results
    .into_iter()
    .map(|(path, value)| (path, value.unwrap_or(Value::Null)))
    .collect();
  Ok(Value::Object(map))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _guard = init_logging(&log_dir(&config)?);

  let engine = SyncEngine::from_config(&config, !args.offline)?;

  match args.command {
    Command::Status => print(&json!({
      "online": engine.connectivity().is_online(),
      "pending": engine.queue().len(),
      "cacheKeys": engine.cache().keys(),
    }))?,
    Command::Queue => print(&engine.queue().snapshot())?,
    Command::Drain => match engine.drain().await {
      Some(report) => print(&report)?,
      None => return Err(eyre!("Not draining: offline or another pass is running")),
    },
    Command::Get { targets } => print(&fetch_all(&engine, &targets).await?)?,
    Command::Cache { key } => match engine.cache().read(&key) {
      Some(value) => print(&value)?,
      None => return Err(eyre!("Nothing cached under {}", key)),
    },
  }

  Ok(())
}
