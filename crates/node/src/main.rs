//! Mesh Node
//!
//! Main entry point for the distributed chat mesh.
//! Runs one of three processes: a chat server node, the rank authority, or
//! the fan-out broker. Server state is persisted to disk and survives
//! restarts.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use mesh_bus::{Broker, BrokerBus};
use mesh_server::NodeBuilder;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{advertised_addr, generated_name, node_config, Intervals, ServerSettings};

/// Process mode
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Chat server node - serves clients, elects, syncs and replicates
    Server,
    /// Rank authority - assigns ranks and tracks liveness
    Reference,
    /// Fan-out broker - forwards published messages to subscribers
    Proxy,
}

/// Distributed chat mesh node
#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(about = "Replicated chat server with rank-based coordination", long_about = None)]
struct Args {
    /// Process mode (server, reference or proxy)
    #[arg(long, value_enum, default_value = "server")]
    mode: Mode,

    /// Unique node name (server mode); random when unset
    #[arg(long, env = "MESH_NODE_NAME")]
    name: Option<String>,

    /// Bind address; defaults to :5555 (server), :5559 (reference), :5557 (proxy)
    #[arg(long)]
    bind_addr: Option<String>,

    /// Address peers use to reach this server; derived from the bind address when unset
    #[arg(long, env = "MESH_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,

    /// Rank authority address
    #[arg(long, env = "MESH_REFERENCE_ADDR", default_value = "127.0.0.1:5559")]
    reference_addr: String,

    /// Fan-out broker address
    #[arg(long, env = "MESH_BROKER_ADDR", default_value = "127.0.0.1:5557")]
    broker_addr: String,

    /// Data directory for persistent state
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Keep server state in memory only
    #[arg(long)]
    in_memory: bool,

    /// Heartbeat period in seconds
    #[arg(long, default_value = "5")]
    heartbeat_secs: u64,

    /// Election retry period in seconds
    #[arg(long, default_value = "5")]
    election_secs: u64,

    /// Clock sync period in seconds
    #[arg(long, default_value = "30")]
    sync_secs: u64,

    /// Timeout for every outbound request in milliseconds
    #[arg(long, default_value = "2000")]
    request_timeout_ms: u64,

    /// Seconds a node stays listed without heartbeats (reference mode)
    #[arg(long, default_value = "30")]
    heartbeat_timeout_secs: u64,

    /// Stale node sweep period in seconds (reference mode)
    #[arg(long, default_value = "10")]
    cleanup_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_settings(&self) -> ServerSettings {
        let name = self.name.clone().unwrap_or_else(generated_name);
        let bind_addr = self.bind_addr.clone().unwrap_or_else(|| "0.0.0.0:5555".to_string());
        let advertise = self
            .advertise_addr
            .clone()
            .unwrap_or_else(|| advertised_addr(&bind_addr));
        let intervals = Intervals {
            heartbeat: Duration::from_secs(self.heartbeat_secs),
            election: Duration::from_secs(self.election_secs),
            sync: Duration::from_secs(self.sync_secs),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        };

        ServerSettings {
            data_dir: (!self.in_memory).then(|| self.data_dir.join(&name)),
            node: node_config(&name, &advertise, &self.reference_addr, intervals),
            bind_addr,
            broker_addr: self.broker_addr.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.mode {
        Mode::Server => run_server(args.server_settings()).await,
        Mode::Reference => run_reference(args).await,
        Mode::Proxy => run_proxy(args).await,
    }
}

/// Run a chat server node
async fn run_server(settings: ServerSettings) -> Result<()> {
    tracing::info!("Starting mesh node {} - SERVER MODE", settings.node.name);
    tracing::info!("  Requests: {} (advertised as {})", settings.bind_addr, settings.node.addr);
    tracing::info!("  Rank authority: {}", settings.node.reference_addr);
    tracing::info!("  Broker: {}", settings.broker_addr);
    match &settings.data_dir {
        Some(dir) => tracing::info!("  Data directory: {:?}", dir),
        None => tracing::info!("  State kept in memory"),
    }

    let mut builder = NodeBuilder::new(settings.node.clone())
        .bus(Arc::new(BrokerBus::new(settings.broker_addr.clone())));
    if let Some(dir) = &settings.data_dir {
        builder = builder.data_dir(dir);
    }
    let node = Arc::new(builder.build()?);

    let mut tasks = node.start();

    let server_node = node.clone();
    let bind_addr = settings.bind_addr.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server_node.serve(&bind_addr).await {
            tracing::error!("Request server error: {}", e);
        }
    }));

    tracing::info!("Node running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    for task in &tasks {
        task.abort();
    }

    let snapshot = node.ctx().snapshot();
    match node.save() {
        Ok(Some(metadata)) => tracing::info!(
            "Final state saved: {} users, {} channels, {} messages at clock {}",
            metadata.users,
            metadata.channels,
            metadata.messages,
            metadata.clock
        ),
        Ok(None) => {}
        Err(e) => tracing::error!("Failed to save final state: {}", e),
    }

    let stats = node.replicator().stats();
    tracing::info!(
        "Node {} stopped (rank {:?}, coordinator {:?}, {} propagated, {} applied)",
        snapshot.name,
        snapshot.rank,
        snapshot.coordinator,
        stats.propagated,
        stats.applied
    );

    Ok(())
}

/// Run the rank authority
async fn run_reference(args: Args) -> Result<()> {
    let bind_addr = args.bind_addr.unwrap_or_else(|| "0.0.0.0:5559".to_string());
    tracing::info!("Starting rank authority - REFERENCE MODE");
    tracing::info!("  Heartbeat timeout: {}s", args.heartbeat_timeout_secs);

    tokio::select! {
        result = mesh_reference::run(
            &bind_addr,
            Duration::from_secs(args.heartbeat_timeout_secs),
            Duration::from_secs(args.cleanup_secs),
        ) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down rank authority...");
        }
    }

    Ok(())
}

/// Run the fan-out broker
async fn run_proxy(args: Args) -> Result<()> {
    let bind_addr = args.bind_addr.unwrap_or_else(|| "0.0.0.0:5557".to_string());
    tracing::info!("Starting fan-out broker - PROXY MODE on {}", bind_addr);

    tokio::select! {
        result = Broker::new().run(&bind_addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down broker...");
        }
    }

    Ok(())
}
