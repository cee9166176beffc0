//! WolfSync - Peer-to-peer file replication node
//!
//! Keeps a shared directory in sync across a fixed set of peers using an
//! operation log, heartbeats, an offline queue and periodic anti-entropy.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::api::HttpServer;
use wolfsync::config::{sample_config, WolfSyncConfig};
use wolfsync::node::Node;

/// WolfSync - Peer-to-peer file replication
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfSync node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,

        /// Node name
        #[arg(long, default_value = "node-1")]
        node_name: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, node_name } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(output, node_name)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the node and serve until Ctrl+C
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> anyhow::Result<()> {
    let config = WolfSyncConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    init_logging(log_level.as_deref().unwrap_or(&config.logging.level));
    tracing::info!("Starting WolfSync node {}", config.node.name);

    let api_config = config.api.clone();
    let node = Node::new(config).context("failed to open node state")?;
    let addr = node.start().context("failed to start node networking")?;
    tracing::info!("Node {} accepting peers on {}", node.name(), addr);

    if api_config.enabled {
        let server = HttpServer::new(api_config, std::sync::Arc::clone(&node));
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("HTTP API stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    tokio::task::spawn_blocking(move || node.stop())
        .await
        .context("shutdown task failed")?;
    Ok(())
}

/// Write a sample configuration
fn run_init(output: PathBuf, node_name: String) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }

    std::fs::write(&output, sample_config(&node_name))
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the [peers] table so every node lists the same peers.");
    println!("Then start with: wolfsync --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node:           {}", config.node.name);
            println!("  Bind Address:   {}", config.bind_address());
            println!("  Peers:          {}", config.peers.len().saturating_sub(1));
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = WolfSyncConfig::from_file(&config_path)?;

    println!("WolfSync Node Information");
    println!("=========================");
    println!();
    println!("Node:             {}", config.node.name);
    println!("Bind Address:     {}", config.bind_address());
    println!("Shared Directory: {}", config.node.shared_dir.display());
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!();
    println!("Peers:");
    for peer in config.peer_table() {
        let marker = if peer.name == config.node.name { " (this node)" } else { "" };
        println!("  {:<16} {}{}", peer.name, peer.socket_address(), marker);
    }
    println!();
    println!("Cluster Configuration:");
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!("  Node Timeout:   {} ms", config.cluster.node_timeout_ms);
    println!("  RPC Timeout:    {} ms", config.cluster.rpc_timeout_ms);
    println!("  Max Retries:    {}", config.cluster.max_retries);
    println!("  Sync Interval:  {} ms", config.cluster.sync_interval_ms);
    println!();
    println!("HTTP API:         {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });

    Ok(())
}
