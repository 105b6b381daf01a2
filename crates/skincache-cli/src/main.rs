//! Command line driver for the skincache worker.
//!
//! Each invocation hosts the worker for one cache directory, acting as a
//! single open tab for the duration of the command.
//!
//! ## Usage
//!
//! ```bash
//! # Fetch through the cache and save the body
//! skincache fetch https://ddragon.leagueoflegends.com/api/versions.json -o versions.json
//!
//! # Show partition usage
//! skincache status
//!
//! # Serve from the cache only
//! skincache --offline fetch http://localhost:5173/index.html
//!
//! # Revalidate the version manifest every ten minutes
//! skincache refresh --every 600
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skincache_common::{init_logging, LogConfig, LogFormat, RetryConfig};
use skincache_net::{Fetcher, HttpFetcher, LoaderConfig, MockFetcher, Request};
use skincache_sw::{
    BroadcastMessage, CacheStatus, ClearCacheReply, ClientId, ControlMessage, PartitionStore,
    WorkerConfig, WorkerHandle, WorkerHost, BACKGROUND_SYNC_TAG,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Level};

mod output;
mod state;

use state::RegistrationState;

#[derive(Parser)]
#[command(name = "skincache")]
#[command(about = "Offline asset cache for Skin Explorer", version)]
struct Cli {
    /// Worker configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory [default: platform cache dir/skincache]
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Treat the network as unreachable
    #[arg(long, global = true)]
    offline: bool,

    /// Retry attempts for transport failures
    #[arg(long, global = true, default_value = "1")]
    attempts: u32,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL through the worker
    Fetch {
        /// Request URL
        url: String,
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Request body, sent as-is
        #[arg(short, long)]
        data: Option<String>,
        /// Write the body here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show entry count and size per partition
    Status {
        /// Print the raw GET_CACHE_STATUS reply
        #[arg(long)]
        json: bool,
    },

    /// Delete every partition
    Clear,

    /// Revalidate the version manifest
    Refresh {
        /// Keep running and refresh every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },

    /// Activate a waiting worker now
    SkipWaiting,
}

fn log_config(cli: &Cli) -> LogConfig {
    let config = match cli.verbose {
        0 => LogConfig::default(),
        1 => LogConfig::debug(),
        _ => LogConfig {
            level: Level::TRACE,
            ..LogConfig::debug()
        },
    };
    config.with_format(cli.log_format)
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skincache")
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(WorkerConfig::default()),
    }
}

fn build_fetcher(cli: &Cli) -> Result<Arc<dyn Fetcher>> {
    if cli.offline {
        info!("Offline mode, every network request fails");
        return Ok(Arc::new(MockFetcher::offline()));
    }
    let loader = LoaderConfig {
        retry: RetryConfig::attempts(cli.attempts),
        ..LoaderConfig::default()
    };
    Ok(Arc::new(HttpFetcher::new(loader)?))
}

/// The tab this process represents.
struct Session {
    client: ClientId,
    updates: broadcast::Receiver<BroadcastMessage>,
}

/// Restore the previously active version, open the session tab, then install
/// the configured version if it differs.
async fn bootstrap(
    host: &WorkerHost,
    handle: &WorkerHandle,
    config: &WorkerConfig,
    state: &RegistrationState,
) -> Result<Session> {
    if let Some(previous) = &state.active_version {
        host.resume(config.clone().with_version(previous.clone()))
            .await
            .with_context(|| format!("resuming worker {previous}"))?;
    }

    let (client, updates) = handle.open_client(config.origin_url()?).await?;

    if state.active_version.as_deref() != Some(config.version.as_str()) {
        match handle.install(config.clone()).await {
            Ok(id) => info!(worker = %id, version = %config.version, "Installed worker"),
            Err(e) => match &state.active_version {
                Some(previous) => {
                    warn!(error = %e, version = %previous, "Install failed, previous version stays in control")
                }
                None => warn!(error = %e, "Install failed, requests go straight to the network"),
            },
        }
    }

    Ok(Session { client, updates })
}

async fn run_command(
    command: &Commands,
    host: &Arc<WorkerHost>,
    handle: &WorkerHandle,
) -> Result<()> {
    match command {
        Commands::Fetch {
            url,
            method,
            data,
            output: destination,
        } => {
            let mut request = Request::parse(method, url)?;
            if let Some(data) = data {
                request = request.with_body(data.clone());
            }
            let response = handle.fetch(request).await?;
            eprintln!("{} {}", response.status.as_u16(), response.status_text());
            let body = response.bytes();
            match destination {
                Some(path) => {
                    tokio::fs::write(path, &body)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!(
                        "Wrote {} to {}",
                        output::format_cache_size(body.len() as u64),
                        path.display()
                    );
                }
                None => std::io::stdout().lock().write_all(&body)?,
            }
        }
        Commands::Status { json } => {
            let reply = handle
                .post_message(ControlMessage::GetCacheStatus.to_value())
                .await?
                .unwrap_or_else(|| serde_json::json!({}));
            if *json {
                println!("{}", serde_json::to_string_pretty(&reply)?);
            } else {
                let status: CacheStatus = serde_json::from_value(reply)?;
                print!("{}", output::render_status(&status));
            }
        }
        Commands::Clear => {
            let reply = handle
                .post_message(ControlMessage::ClearCache.to_value())
                .await?
                .context("no reply to CLEAR_CACHE")?;
            let reply: ClearCacheReply = serde_json::from_value(reply)?;
            if !reply.success {
                anyhow::bail!("clearing the cache failed");
            }
            println!("Cache cleared");
        }
        Commands::Refresh { every: None } => {
            if handle.sync(BACKGROUND_SYNC_TAG).await? {
                println!("Version manifest refreshed");
            } else {
                println!("Version manifest unchanged");
            }
        }
        Commands::Refresh { every: Some(secs) } => {
            let period = Duration::from_secs((*secs).max(1));
            info!(?period, "Refreshing periodically, Ctrl-C to stop");
            handle.sync(BACKGROUND_SYNC_TAG).await?;
            let driver = host.spawn_periodic_refresh(period);
            tokio::signal::ctrl_c().await?;
            driver.abort();
        }
        Commands::SkipWaiting => {
            let waiting = host.waiting().await.map(|w| w.version().to_string());
            handle
                .post_message(ControlMessage::SkipWaiting.to_value())
                .await?;
            match waiting {
                Some(version) => println!("Activated {version}"),
                None => println!("No waiting worker"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(log_config(&cli));

    let config = load_config(cli.config.as_deref())?;
    let cache_dir = cli.cache_dir.clone().unwrap_or_else(default_cache_dir);
    debug!(cache_dir = %cache_dir.display(), version = %config.version, "Starting");

    let store = PartitionStore::open_dir(cache_dir.join("partitions"))
        .await
        .context("opening partition store")?;
    let host = Arc::new(WorkerHost::new(config.origin_url()?, store, build_fetcher(&cli)?));
    let (handle, event_loop) = Arc::clone(&host).spawn();

    let state = RegistrationState::load(&cache_dir).await;
    let mut session = bootstrap(&host, &handle, &config, &state).await?;

    let result = run_command(&cli.command, &host, &handle).await;

    // Closing the session tab lets a waiting worker take over
    host.close_client(session.client).await?;
    host.settle().await;

    while let Ok(BroadcastMessage::DataUpdated { url, timestamp }) = session.updates.try_recv() {
        info!(%url, timestamp, "Data updated");
    }

    let state = RegistrationState {
        active_version: host.active().await.map(|w| w.version().to_string()),
    };
    state.save(&cache_dir).await?;

    drop(handle);
    if let Err(e) = event_loop.await {
        warn!(error = %e, "Event loop ended abnormally");
    }

    result
}
