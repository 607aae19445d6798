use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use shopsync::config::Config;
use shopsync::connectivity::HttpProbe;
use shopsync::store::CacheCategory;
use shopsync::{
  Action, Category, ConnectivityMonitor, HttpTransport, IntentId, Method, Mutation, NewIntent,
  PassOutcome, QueueStats, StatusReporter, Store, SyncEngine, SyncSettings,
};

#[derive(Parser, Debug)]
#[command(name = "shopsync")]
#[command(about = "Offline mutation queue and sync engine for storefront clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shopsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// SQLite database holding the queue and cache
  #[arg(short, long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a mutation for delivery
  Enqueue {
    #[arg(long)]
    category: Category,
    #[arg(long)]
    action: Action,
    /// Defaults to POST for create, PUT for update, DELETE for delete
    #[arg(long)]
    method: Option<Method>,
    #[arg(long)]
    endpoint: String,
    /// JSON body
    #[arg(long)]
    payload: Option<String>,
  },
  /// Run one sync pass now
  Sync,
  /// Show queue counts
  Status {
    #[arg(long)]
    json: bool,
  },
  /// List queued intents
  List,
  /// Keep syncing in the background until interrupted
  Run,
  /// Inspect or recover intents that ran out of retries
  Dead {
    #[command(subcommand)]
    command: DeadCommand,
  },
  /// Read or write the TTL cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
}

#[derive(Subcommand, Debug)]
enum DeadCommand {
  List,
  Requeue { id: i64 },
  Purge,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get {
    key: String,
  },
  Put {
    key: String,
    category: CacheCategory,
    /// JSON value
    value: String,
    /// Defaults to cache.default_ttl_secs
    #[arg(long)]
    ttl_secs: Option<u64>,
  },
  Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(database) = args.database {
    Config {
      database_path: Some(database),
      ..config
    }
  } else {
    config
  };

  let _log_guard = init_logging(config.log_dir.as_deref())?;

  let store = Store::open(&config.database_path()?)?.with_max_queue_len(config.sync.max_queue_len);
  let store = Arc::new(store);

  match args.command {
    Command::Enqueue {
      category,
      action,
      method,
      endpoint,
      payload,
    } => {
      let body = payload
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let mutation = Mutation::from_parts(category, body)?;
      let method = method.unwrap_or(match action {
        Action::Create => Method::Post,
        Action::Update => Method::Put,
        Action::Delete => Method::Delete,
      });

      let id = store
        .enqueue(&NewIntent::new(mutation, action, method, endpoint))
        .map_err(|e| eyre!("Could not save this action offline: {}", e))?;
      println!("queued intent {}", id);
    }
    Command::Sync => {
      let (engine, probe) = build_engine(&config, store.clone()).await?;
      let outcome = engine.sync_now().await;
      if let Some(probe) = probe {
        probe.abort();
      }
      match outcome? {
        PassOutcome::Completed(report) => println!(
          "attempted {}, delivered {}, failed {}, lost {}",
          report.attempted, report.delivered, report.failed, report.lost
        ),
        PassOutcome::AlreadyRunning => println!("a sync pass is already running"),
        PassOutcome::Offline => println!("offline, nothing attempted"),
      }
      print_stats(&store.stats()?);
    }
    Command::Status { json } => {
      let stats = StatusReporter::new(store.clone()).snapshot()?;
      if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
      } else {
        print_stats(&stats);
      }
    }
    Command::List => {
      for intent in store.list_all()? {
        println!(
          "{:>6}  {:<8} {:<8} {:<6} {:<7} retries={} {}{}",
          intent.id,
          intent.category,
          intent.action,
          intent.method,
          intent.status,
          intent.retry_count,
          intent.endpoint,
          intent
            .last_error
            .map(|e| format!("  ({})", e))
            .unwrap_or_default()
        );
      }
    }
    Command::Run => run(&config, store).await?,
    Command::Dead { command } => match command {
      DeadCommand::List => {
        for letter in store.dead_letters()? {
          println!(
            "{:>6}  {:<8} {:<8} {} attempts={} failed_at={} {}",
            letter.id,
            letter.category,
            letter.action,
            letter.endpoint,
            letter.attempts,
            letter.failed_at.to_rfc3339(),
            letter.last_error.unwrap_or_default()
          );
        }
      }
      DeadCommand::Requeue { id } => {
        store.requeue_dead(IntentId(id))?;
        println!("requeued intent {}", id);
      }
      DeadCommand::Purge => println!("purged {} dead letters", store.purge_dead()?),
    },
    Command::Cache { command } => match command {
      CacheCommand::Get { key } => match store.cache_get(&key)? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("miss"),
      },
      CacheCommand::Put {
        key,
        category,
        value,
        ttl_secs,
      } => {
        let value: Value =
          serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
        let ttl = ttl_secs.map_or_else(|| config.cache.default_ttl(), Duration::from_secs);
        store.cache_put(&key, category, &value, ttl)?;
      }
      CacheCommand::Sweep => println!("swept {} entries", store.cache_sweep_expired()?),
    },
  }

  Ok(())
}

/// Engine wired to the HTTP transport and, when configured, a reachability
/// probe. The probe task runs until its handle is aborted.
async fn build_engine(
  config: &Config,
  store: Arc<Store>,
) -> Result<(SyncEngine, Option<JoinHandle<()>>)> {
  let transport = Arc::new(HttpTransport::new(config)?);

  let (monitor, probe) = match &config.connectivity.probe_url {
    Some(raw) => {
      let url = Url::parse(raw)?;
      let probe = HttpProbe::new(url, Duration::from_secs(config.connectivity.probe_interval_secs))?;
      let monitor = Arc::new(ConnectivityMonitor::new(probe.check().await));
      let handle = probe.spawn(monitor.clone());
      (monitor, Some(handle))
    }
    None => (Arc::new(ConnectivityMonitor::new(true)), None),
  };

  let engine = SyncEngine::new(store, transport, monitor, SyncSettings::from(config))?;
  Ok((engine, probe))
}

async fn run(config: &Config, store: Arc<Store>) -> Result<()> {
  let (engine, probe) = build_engine(config, store.clone()).await?;
  let reporter = StatusReporter::new(store);
  let mut status = reporter.watch();
  let poller = reporter.spawn(Duration::from_secs(config.status.refresh_secs));

  engine.start();
  tracing::info!("running, press Ctrl-C to stop");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let stats = *status.borrow_and_update();
        print_stats(&stats);
      }
    }
  }

  poller.abort();
  if let Some(probe) = probe {
    probe.abort();
  }
  engine.stop().await;
  Ok(())
}

fn print_stats(stats: &QueueStats) {
  println!(
    "total {}  pending {}  syncing {}  error {}  delivered {}  dead {}",
    stats.total, stats.pending, stats.syncing, stats.error, stats.success, stats.dead
  );
}

/// Log to a daily file under `log_dir` if set, otherwise stderr.
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("SHOPSYNC_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("info"));

  match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "shopsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}
