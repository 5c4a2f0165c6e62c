//! Load generator for `nebula-pool`.
//!
//! Creates one pool against the in-memory store and fires concurrent reads,
//! inserts and database-wide reads at it, logging per-call latency and the
//! final pool statistics.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::Parser;
use nebula_pool::testing::{MemoryConnector, MemoryError};
use nebula_pool::{ConnectOptions, Registry};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

const PREFIX: &str = "MONGO";
const COLLECTION: &str = "items_test";

#[derive(Debug, Parser)]
#[command(name = "pool-demo", version, about = "Exercise a bounded session pool")]
struct Args {
    /// Number of workers (and sessions).
    #[arg(long = "max-workers", env = "POOL_MAX_WORKERS", default_value_t = 3)]
    max_workers: usize,

    /// Dispatcher queue capacity.
    #[arg(long = "max-queue", env = "POOL_MAX_QUEUE", default_value_t = 10)]
    max_queue: usize,

    /// Load size: each of the three kinds of work runs `tasks / 2` calls.
    #[arg(long, default_value_t = 20)]
    tasks: usize,

    /// Target host.
    #[arg(long, env = "POOL_HOST", default_value = "localhost")]
    host: String,

    /// Target port.
    #[arg(long, env = "POOL_PORT", default_value_t = 27017)]
    port: u16,

    /// Database name.
    #[arg(long, env = "POOL_DATABASE", default_value = "test")]
    database: String,

    /// User name.
    #[arg(long, env = "POOL_USERNAME")]
    username: Option<String>,

    /// Password.
    #[arg(long, env = "POOL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Connect and call timeout, e.g. `1s` or `2500ms`.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Simulated latency of every call.
    #[arg(long, default_value = "5ms", value_parser = humantime::parse_duration)]
    work_latency: Duration,

    /// Read connect options from a TOML file instead of the flags above.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn connect_options(&self) -> anyhow::Result<ConnectOptions> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        let mut options = ConnectOptions::new(addr, &self.database).with_timeout(self.timeout);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options = options.with_credentials(user, pass);
        }
        Ok(options)
    }
}

fn init_logging(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let options = args.connect_options()?;
    tracing::info!(
        workers = args.max_workers,
        queue = args.max_queue,
        tasks = args.tasks,
        ?options,
        "starting"
    );

    let registry = Arc::new(Registry::new(MemoryConnector::new()));
    registry
        .create(PREFIX, Some(options), args.max_workers, args.max_queue)
        .await
        .context("creating pool")?;

    let mut set = JoinSet::new();
    let per_kind = args.tasks / 2;
    set.spawn(inserts(Arc::clone(&registry), per_kind, args.work_latency));
    set.spawn(reads(Arc::clone(&registry), per_kind, args.work_latency));
    set.spawn(database_reads(Arc::clone(&registry), per_kind, args.work_latency));

    let mut failures = 0;
    while let Some(joined) = set.join_next().await {
        failures += joined.context("load task panicked")?;
    }

    let pool = registry.get(PREFIX)?;
    tracing::info!(failures, stats = ?pool.stats(), "load finished");

    registry.shutdown().await;
    Ok(())
}

async fn inserts(registry: Arc<Registry<MemoryConnector>>, n: usize, latency: Duration) -> usize {
    let mut failures = 0;
    for i in 0..n {
        let started = Instant::now();
        let result = registry
            .execute_with_collection(PREFIX, COLLECTION, move |c| async move {
                tokio::time::sleep(latency).await;
                c.insert(serde_json::json!({ "link": i.to_string() }))
            })
            .await;
        match result {
            Ok(()) => tracing::info!(i, elapsed = ?started.elapsed(), "insert done"),
            Err(e) => {
                failures += 1;
                tracing::error!(i, error = %e, "insert failed");
            }
        }
    }
    failures
}

async fn reads(registry: Arc<Registry<MemoryConnector>>, n: usize, latency: Duration) -> usize {
    let mut failures = 0;
    for i in 0..n {
        let started = Instant::now();
        let result = registry
            .execute_with_collection(PREFIX, COLLECTION, move |c| async move {
                tokio::time::sleep(latency).await;
                c.find(10)
            })
            .await;
        match result {
            Ok(items) => {
                tracing::info!(i, results = items.len(), elapsed = ?started.elapsed(), "find done");
            }
            Err(e) => {
                failures += 1;
                tracing::error!(i, error = %e, "find failed");
            }
        }
    }
    failures
}

async fn database_reads(
    registry: Arc<Registry<MemoryConnector>>,
    n: usize,
    latency: Duration,
) -> usize {
    let mut failures = 0;
    for i in 0..n {
        let started = Instant::now();
        let result = registry
            .execute_with_database(PREFIX, move |db| async move {
                tokio::time::sleep(latency).await;
                db.collection(COLLECTION).find(20)
            })
            .await;
        match result {
            Ok(items) => {
                tracing::info!(
                    i,
                    results = items.len(),
                    elapsed = ?started.elapsed(),
                    "database find done"
                );
            }
            Err(e) => {
                failures += 1;
                if e.downcast_work::<MemoryError>().is_some() {
                    tracing::error!(i, error = %e, "store rejected database find");
                } else {
                    tracing::error!(i, error = %e, "database find failed");
                }
            }
        }
    }
    failures
}
