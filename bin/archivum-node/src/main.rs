//! Archivum node daemon
//!
//! Hosts one or more storage nodes, publishes their capacity to the
//! directory and runs the background loops: heartbeats, garbage collection
//! and deferred directory publication.

mod service;

use anyhow::{Context, Result};
use archivum_common::config::{LogFormat, LoggingConfig};
use archivum_common::{Config, clock::system_clock};
use archivum_engine::StorageEngine;
use archivum_placement::{CapacityDirectory, FallbackDirectory, HttpDirectory, MemoryDirectory};
use clap::Parser;
use service::HealthState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "archivum-node")]
#[command(about = "Archivum storage node daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/archivum/node.toml")]
    config: PathBuf,

    /// Listen address for the HTTP surface
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Data directory for the catalog
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Remote capacity directory; without one the directory is hosted here
    #[arg(long, env = "ARCHIVUM_DIRECTORY_ENDPOINT")]
    directory_endpoint: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

/// Load the config file (a missing file means defaults) and apply CLI overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        Config::from_toml(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    if let Some(listen) = args.listen {
        config.listen.addr = listen;
    }
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if let Some(endpoint) = &args.directory_endpoint {
        config.directory.endpoint = Some(endpoint.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging);

    info!("Starting Archivum node");
    info!("Config file: {}", args.config.display());
    if config.node.nodes.is_empty() {
        anyhow::bail!("no storage nodes configured in {}", args.config.display());
    }
    for node in &config.node.nodes {
        info!(
            node_id = %node.node_id,
            mode = %node.mode,
            root = %node.root.display(),
            capacity = node.total_capacity,
            "Storage node configured"
        );
    }

    let clock = system_clock();
    let (live, hosted): (Arc<dyn CapacityDirectory>, Option<Arc<dyn CapacityDirectory>>) =
        match &config.directory.endpoint {
            Some(endpoint) => {
                info!("Using remote capacity directory at {endpoint}");
                let remote = HttpDirectory::new(endpoint.clone(), config.directory.request_timeout())?;
                (Arc::new(remote), None)
            }
            None => {
                info!("Hosting the capacity directory in-process");
                let memory: Arc<dyn CapacityDirectory> =
                    Arc::new(MemoryDirectory::new(Arc::clone(&clock)));
                (Arc::clone(&memory), Some(memory))
            }
        };
    let directory = Arc::new(FallbackDirectory::new(
        live,
        config.directory.static_nodes.clone(),
        config.directory.snapshot_max_staleness(),
        Arc::clone(&clock),
    ));

    let listen = config.listen.addr;
    let heartbeat_interval = config.directory.heartbeat_interval();
    let gc_interval = config.gc.interval();
    let publish_interval = config.saga.publish_retry_interval();

    let engine = Arc::new(
        StorageEngine::open(config, directory.clone(), clock)
            .await
            .context("opening storage engine")?,
    );
    let nodes: Vec<_> = engine.context().nodes.ids().collect();

    // Peers must see the nodes before recovery re-publishes anything
    let accepted = engine.publish_heartbeats().await;
    info!("Initial heartbeat accepted for {accepted}/{} nodes", nodes.len());
    let report = engine.recover().await.context("startup recovery")?;
    info!(
        finalizations = report.finalizations.len(),
        sagas = report.sagas.len(),
        "Startup recovery complete"
    );

    let cancel = engine.cancellation();
    let background = vec![
        tokio::spawn(heartbeat_loop(
            Arc::clone(&engine),
            heartbeat_interval,
            cancel.clone(),
        )),
        tokio::spawn(engine.collector().run(gc_interval, cancel.clone())),
        tokio::spawn(engine.publisher().run(publish_interval, cancel.clone())),
    ];

    let app = service::app(
        hosted,
        HealthState {
            directory,
            nodes,
        },
    );
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("HTTP listening on {listen}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    engine.shutdown();
    for handle in background {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {e}");
        }
    }
    info!("Archivum node shut down gracefully");
    Ok(())
}

/// Publish fresh descriptors for every local node on `interval`
async fn heartbeat_loop(engine: Arc<StorageEngine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let accepted = engine.publish_heartbeats().await;
        debug!(accepted, "Heartbeats published");
    }
    debug!("Heartbeat loop stopped");
}
