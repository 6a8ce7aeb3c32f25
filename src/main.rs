mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use syncstore::cache::LocalPersistence;
use syncstore::{
  derive_cache_key, diff, CollectionUpdate, CollectionUseCase, Credentials, Entity, FetcherConfig, HttpTransport,
  RemoteFetcher, RemoteRequest, Scope, SqliteStorage, StaticSession, Store, SyncEngine, UseCaseBuilder, WritePolicy,
};

/// Field recording which API path a cached record came from.
const SOURCE_FIELD: &str = "_source";

#[derive(Parser, Debug)]
#[command(name = "syncstore")]
#[command(about = "Sync paginated REST collections into a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/syncstore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch API paths into the cache and print what changed
  Sync {
    /// API paths relative to the configured base URL
    #[arg(required = true)]
    paths: Vec<String>,

    /// Field to order records by
    #[arg(short, long, default_value = "id")]
    sort: String,

    /// Refetch even if the cache is still fresh
    #[arg(short, long)]
    force: bool,

    /// Serve from the cache without network access
    #[arg(long)]
    offline: bool,
  },
  /// Print cached records for an API path
  Show {
    path: String,

    #[arg(short, long, default_value = "id")]
    sort: String,
  },
  /// Remove every cached record
  Clear,
}

/// Any API object with an `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
  id: Value,
  #[serde(flatten)]
  fields: Map<String, Value>,
}

impl Entity for Record {
  fn id(&self) -> String {
    match &self.id {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    }
  }

  fn entity_type() -> &'static str {
    "record"
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_logging()?;

  let storage: Arc<dyn LocalPersistence> = Arc::new(match &config.cache.path {
    Some(path) => SqliteStorage::open(path)?,
    None => SqliteStorage::open_default()?,
  });

  match args.command {
    Command::Sync {
      paths,
      sort,
      force,
      offline,
    } => sync(&config, storage, &paths, &sort, force, offline).await,
    Command::Show { path, sort } => {
      let engine = SyncEngine::local(storage)?;
      let store = engine.store(use_case(&config, &path, &sort)?);
      print_records(&store)?;
      Ok(())
    }
    Command::Clear => {
      storage.clear()?;
      println!("cache cleared");
      Ok(())
    }
  }
}

/// Log to a file under the data directory; stdout is reserved for output.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("syncstore");
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::never(log_dir, "syncstore.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("SYNCSTORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

fn use_case(config: &config::Config, path: &str, sort: &str) -> Result<CollectionUseCase<Record>> {
  let mut request = RemoteRequest::get(path);
  if let Some(envelope) = &config.api.envelope {
    request = request.envelope(envelope.clone());
  }
  if let Some(page_size) = config.api.page_size {
    request = request.per_page(page_size);
  }

  let scope = Scope::where_eq(SOURCE_FIELD, path, sort);
  let mut builder = UseCaseBuilder::<Record>::new(derive_cache_key("path", &[config.api.base_url.as_str(), path]))
    .request(request)
    .scope(scope)
    .write_policy(WritePolicy::collection())
    .with_field(SOURCE_FIELD, path);
  if let Some(ttl) = config.cache.ttl() {
    builder = builder.ttl(ttl);
  }
  Ok(builder.build()?)
}

async fn sync(
  config: &config::Config,
  storage: Arc<dyn LocalPersistence>,
  paths: &[String],
  sort: &str,
  force: bool,
  offline: bool,
) -> Result<()> {
  let transport = Arc::new(HttpTransport::new(&config.api.base_url)?);
  let session = Arc::new(StaticSession::new(config::Config::api_token().map(Credentials::bearer)));
  let fetcher = RemoteFetcher::new(transport, session, FetcherConfig::from(&config.fetch))?;
  let engine = SyncEngine::new(storage, fetcher)?;
  engine.set_offline(offline);

  let mut stores = Vec::with_capacity(paths.len());
  for path in paths {
    let store = engine.store(use_case(config, path, sort)?);
    let before = store.snapshot();
    store.refresh(force);
    stores.push((path, store, before));
  }

  futures::future::join_all(stores.iter().map(|(_, store, _)| store.wait_idle())).await;

  let mut failed = 0;
  for (path, store, before) in &stores {
    println!("== {}", path);
    if let Some(error) = store.error() {
      eprintln!("sync failed: {}", error);
      failed += 1;
      continue;
    }
    print_records(store)?;
    print_changes(&diff(before, &store.snapshot()));
    if let Some(warning) = store.warning() {
      eprintln!("skipped {} malformed records", warning.skipped.len());
    }
  }

  if failed > 0 {
    return Err(eyre!("{} of {} paths failed to sync", failed, stores.len()));
  }
  Ok(())
}

fn print_records(store: &Store<CollectionUseCase<Record>>) -> Result<()> {
  for record in store.snapshot().iter() {
    let mut record = record.clone();
    record.fields.remove(SOURCE_FIELD);
    println!("{}", serde_json::to_string(&record)?);
  }
  Ok(())
}

fn print_changes(changes: &[CollectionUpdate]) {
  if changes.is_empty() {
    println!("no changes");
    return;
  }
  for change in changes {
    match change {
      CollectionUpdate::Inserted(index) => println!("+ inserted at {}", index),
      CollectionUpdate::Deleted(index) => println!("- deleted at {}", index),
      CollectionUpdate::Updated(index) => println!("~ updated at {}", index),
      CollectionUpdate::Moved { from, to } => println!("> moved {} -> {}", from, to),
    }
  }
}
