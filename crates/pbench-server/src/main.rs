//! Pbench Server - command-line entry point for the dataset pipeline.
//!
//! Each subcommand runs one pass of a batch driver, or a single maintenance
//! operation, against the configured archive and database. A first
//! interrupt or SIGTERM lets the current dataset finish; a second aborts it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pbench_core::drivers::{BackupDriver, SizeBucket, UnpackDriver};
use pbench_core::{
    CacheManager, Database, DatasetStore, DriverContext, FileBackupSink, MetadataStore,
    ServerConfig, State, StopToken,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pbench-server")]
#[command(about = "Dataset lifecycle and archive management for the Pbench Server")]
struct Args {
    /// JSON server configuration file
    #[arg(long, conflicts_with = "top_dir")]
    config: Option<PathBuf>,

    /// Use the conventional layout under one directory
    #[arg(long)]
    top_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Unpack datasets waiting for UNPACK
    Unpack {
        /// Smallest tarball size handled, in bytes
        #[arg(long, default_value_t = 0)]
        min_size: u64,
        /// Tarballs of this size or larger are left for another pass
        #[arg(long, default_value_t = u64::MAX)]
        max_size: u64,
    },
    /// Copy datasets waiting for BACKUP to the backup root
    Backup,
    /// Evict unpacked datasets until the goal is met
    Reclaim {
        /// Free space goal as a percentage of the filesystem
        #[arg(long, default_value_t = 20.0)]
        goal_pct: f64,
        /// Free space goal in bytes
        #[arg(long, default_value_t = 0)]
        goal_bytes: u64,
    },
    /// List the archived tarballs
    Discover,
    /// Show a dataset, optionally advancing it to a new state
    State {
        resource_id: String,
        #[arg(long)]
        advance: Option<State>,
    },
    /// Print a metadata value of a dataset
    Metadata { resource_id: String, key: String },
}

fn init_logging(debug: bool, json: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let config = match (&args.config, &args.top_dir) {
        (Some(path), _) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        (None, Some(top)) => {
            let top = std::path::absolute(top)?;
            ServerConfig::with_top_dir(top)
        }
        (None, None) => bail!("one of --config or --top-dir is required"),
    };
    config.validate()?;
    config.ensure_directories()?;
    Ok(config)
}

/// Wait for the next interrupt or termination request.
#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "interrupt"),
        _ = terminate.recv() => Ok("termination request"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "interrupt")
}

/// Escalate the stop token on each interrupt or termination request.
fn watch_signals(stop: StopToken) {
    tokio::spawn(async move {
        while let Ok(signal) = next_signal().await {
            if stop.should_stop() {
                warn!("Second {}, aborting", signal);
            } else {
                info!("{} received, finishing the current dataset", signal);
            }
            stop.escalate();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json);

    let config = load_config(&args)?;
    let db = Database::open(&config.database)?;
    let cache = Arc::new(CacheManager::new(&config));
    let stop = StopToken::new();
    watch_signals(stop.clone());
    let ctx = DriverContext::new(&config, db.clone(), Arc::clone(&cache), stop);

    match args.command {
        Command::Unpack { min_size, max_size } => {
            let driver = UnpackDriver::new(ctx);
            let bucket = SizeBucket { min_size, max_size };
            let results = tokio::task::spawn_blocking(move || driver.run(bucket)).await??;
            println!("{}", results);
        }
        Command::Backup => {
            let Some(root) = config.backup_root.clone() else {
                bail!("no backup-root is configured");
            };
            let driver = BackupDriver::new(ctx, Arc::new(FileBackupSink::new(root)));
            let results = tokio::task::spawn_blocking(move || driver.run()).await??;
            println!("{}", results);
        }
        Command::Reclaim {
            goal_pct,
            goal_bytes,
        } => {
            let reached =
                tokio::task::spawn_blocking(move || cache.reclaim_cache(goal_pct, goal_bytes))
                    .await??;
            if !reached {
                warn!("Reclaim goal not reached");
            }
            println!("{}", if reached { "goal reached" } else { "goal not reached" });
        }
        Command::Discover => {
            let tarballs = tokio::task::spawn_blocking(move || -> pbench_core::Result<_> {
                cache.full_discovery()?;
                cache.datasets()
            })
            .await??;
            for tarball in tarballs {
                println!(
                    "{}\t{}\t{}",
                    tarball.resource_id, tarball.controller, tarball.name
                );
            }
        }
        Command::State {
            resource_id,
            advance,
        } => {
            let store = DatasetStore::new(db);
            let dataset = store.attach(&resource_id, advance)?;
            println!("{}", serde_json::to_string_pretty(&dataset.as_json())?);
        }
        Command::Metadata { resource_id, key } => {
            let store = DatasetStore::new(db.clone());
            let dataset = store.query_by_resource_id(&resource_id)?;
            let metadata = MetadataStore::from_config(db, &config);
            let value = metadata.get_value(&dataset, &key, None)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}
