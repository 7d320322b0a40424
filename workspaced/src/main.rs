mod cli;
mod config;
mod coord;
mod identity;
mod lock;
mod metrics;
mod plugin;
mod queue;
mod sandbox;
mod server;
mod status;
mod storage;
mod util;
mod volume;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coord::{Backend, MemoryBackend, RedisBackend};
use crate::lock::LockService;
use crate::metrics::MetricsRegistry;
use crate::plugin::catalog::Catalog;
use crate::plugin::VolumePlugin;
use crate::queue::StartQueue;
use crate::sandbox::DockerCli;
use crate::server::AppState;
use crate::status::StatusStore;
use crate::storage::Btrfs;
use crate::volume::VolumeManager;
use crate::worker::provision::Provisioner;
use crate::worker::StartWorker;

#[derive(Parser)]
#[command(
    name = "workspaced",
    about = "Per-user sandbox provisioning with replicated copy-on-write home volumes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: volume API, Docker volume plugin and start workers.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify all prerequisites before running 'serve'. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the status record of a workspace start (no daemon needed).
    Status {
        /// Start id returned by POST /workspace/start.
        start_id: String,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config).await?;
        }
        Commands::Status { start_id, config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config, &start_id).await?;
        }
        Commands::Serve { config: config_path } => {
            let config = cli::load_config(config_path)?;
            config.require_secrets()?;
            serve(config).await?;
        }
    }

    Ok(())
}

/// `<host>-<pid>-<n>`: unique per worker task across the cluster.
fn consumer_name(index: usize) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "workspaced".to_string());
    format!("{}-{}-{}", host, std::process::id(), index)
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("workspaced starting with config: {:?}", config);

    let backend: Arc<dyn Backend> = match &config.coord.redis_url {
        Some(url) => Arc::new(
            RedisBackend::connect(url)
                .await
                .context("connecting to coordination backend")?,
        ),
        None => {
            tracing::warn!("no coord.redis_url set, coordinating in-process only");
            Arc::new(MemoryBackend::new())
        }
    };

    let metrics = MetricsRegistry::new();
    let locks = LockService::new(backend.clone(), config.lock.poll_interval());
    let store = Arc::new(Btrfs::new(&config.storage.btrfs_binary));
    let volumes = Arc::new(
        VolumeManager::new(&config, store, locks.clone(), metrics.clone())
            .context("building volume manager")?,
    );
    let found = volumes.load().await.context("scanning volumes root")?;
    tracing::info!(volumes = found, root = %volumes.root().display(), "volume indexes loaded");

    let queue = StartQueue::new(backend.clone(), &config.queue);
    queue.init().await.context("initializing start queue")?;
    let statuses = StatusStore::new(backend.clone(), config.queue.status_ttl());

    let catalog = Catalog::load(&config.server.plugin_state_file)
        .await
        .context("loading plugin catalog")?;
    let plugin = Arc::new(VolumePlugin::new(
        volumes.clone(),
        catalog,
        config.replication.remote_host.clone(),
    ));

    let docker = Arc::new(DockerCli::new(&config.sandbox.docker_binary));
    let provisioner = Provisioner::new(
        docker,
        volumes.clone(),
        config.sandbox.clone(),
        config.secrets.clone(),
    );
    let worker = Arc::new(StartWorker::new(
        &config,
        queue.clone(),
        statuses.clone(),
        locks,
        provisioner,
        metrics.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let socket = config.server.plugin_socket.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = server::plugin::serve(&socket, plugin, cancel).await {
                tracing::error!(error = %e, "volume plugin server failed");
            }
        });
    }

    let state = AppState {
        volumes,
        queue,
        statuses,
        metrics,
        max_attempts: config.worker.max_attempts,
    };
    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "node API listening");
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, server::build_router(state))
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "node API server failed");
            }
        });
    }

    for index in 0..config.worker.concurrency {
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        tasks.spawn(async move { worker.run(consumer_name(index), cancel).await });
    }
    tracing::info!(workers = config.worker.concurrency, "workspaced ready");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    // Workers finish the job they hold before exiting; its message stays
    // pending otherwise and is reclaimed by another node.
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "task panicked during shutdown");
        }
    }
    tracing::info!("workspaced shut down");
    Ok(())
}
