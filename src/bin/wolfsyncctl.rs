//! WolfSyncCtl - Command line tool for a running WolfSync node
//!
//! Usage:
//!   wolfsyncctl files [--node NAME]      - List local or remote files
//!   wolfsyncctl status                   - Show peer liveness
//!   wolfsyncctl sync-status [--file F]   - Show per-file sync state
//!   wolfsyncctl transfer FILE TARGET     - Send a file to a peer
//!   wolfsyncctl delete FILE              - Delete a file everywhere
//!   wolfsyncctl sync                     - Run a drain + sync cycle now

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// WolfSync Control Tool
#[derive(Parser)]
#[command(name = "wolfsyncctl")]
#[command(about = "Control and monitor a WolfSync node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfsync/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List files on this node or on a peer
    Files {
        /// Peer to list instead of the local node
        #[arg(short, long)]
        node: Option<String>,
    },
    /// Show peer liveness
    Status,
    /// Show sync status of one file or all tracked files
    SyncStatus {
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Send a file to a peer
    Transfer { file: String, target: String },
    /// Delete a file on this node and its peers
    Delete { file: String },
    /// Run an offline drain and sync pass now
    Sync,
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    size: u64,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    node: String,
    peers: BTreeMap<String, bool>,
    #[serde(default)]
    sync_state: String,
    #[serde(default)]
    operations: usize,
    #[serde(default)]
    queued: usize,
}

#[derive(Debug, Deserialize)]
struct SyncStatus {
    synced: bool,
    #[serde(default)]
    last_modified: f64,
    #[serde(default)]
    pending_operations: bool,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    status: String,
    message: Option<String>,
    outcome: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    drained: usize,
    #[serde(default)]
    requeued: usize,
    sync: Option<SyncReport>,
}

#[derive(Debug, Deserialize)]
struct SyncReport {
    peers: usize,
    applied: usize,
    deferred: usize,
}

/// Render a node timestamp (seconds since the epoch) in local time
fn format_time(timestamp: f64) -> String {
    if timestamp <= 0.0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp_micros((timestamp * 1_000_000.0) as i64)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Work out the API endpoint from the config file, falling back to localhost
fn endpoint_from_config(path: &Path) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(content) = std::fs::read_to_string(path) else {
        return fallback;
    };
    let Ok(config) = toml::from_str::<Config>(&content) else {
        return fallback;
    };

    let addr = config.api.bind_address;
    if addr.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
    } else {
        format!("http://{}", addr)
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Files { node } => list_files(&client, &endpoint, node.as_deref()).await,
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::SyncStatus { file } => show_sync_status(&client, &endpoint, file.as_deref()).await,
        Commands::Transfer { file, target } => transfer(&client, &endpoint, file, target).await,
        Commands::Delete { file } => delete(&client, &endpoint, file).await,
        Commands::Sync => sync_now(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn get_json<T: serde::de::DeserializeOwned>(client: &reqwest::Client, url: &str) -> anyhow::Result<T> {
    let response = client.get(url).send().await.with_context(|| format!("GET {}", url))?;
    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    Ok(response.json().await?)
}

async fn post_ack(client: &reqwest::Client, url: &str, body: serde_json::Value) -> anyhow::Result<AckResponse> {
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {}", url))?;
    let ack: AckResponse = response.json().await?;
    if ack.status != "ok" {
        bail!("{}", ack.message.unwrap_or_else(|| "request failed".into()));
    }
    Ok(ack)
}

async fn list_files(client: &reqwest::Client, endpoint: &str, node: Option<&str>) -> anyhow::Result<()> {
    let url = match node {
        Some(peer) => format!("{}/api/node_files/{}", endpoint, peer),
        None => format!("{}/api/files", endpoint),
    };
    let files: Vec<FileEntry> = get_json(client, &url).await?;

    if files.is_empty() {
        println!("(no files)");
        return Ok(());
    }

    println!("{:<50} {:>12}", "NAME", "SIZE");
    println!("{}", "-".repeat(63));
    for file in files {
        if file.is_dir {
            println!("{:<50} {:>12}", format!("{}/", file.name), "-");
        } else {
            println!("{:<50} {:>12}", file.name, file.size);
        }
    }
    Ok(())
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let info: NodeInfo = get_json(client, &format!("{}/api/status", endpoint)).await?;

    println!();
    println!("WolfSync Node {} (wolfsyncctl v{})", info.node, env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("Sync: {}  |  Logged ops: {}  |  Queued: {}", info.sync_state, info.operations, info.queued);
    println!();
    println!("{:<20} {:<10}", "NODE", "STATUS");
    println!("{}", "-".repeat(30));
    for (name, alive) in &info.peers {
        let status = if *alive {
            format!("\x1b[32m{:<10}\x1b[0m", "ONLINE")
        } else {
            format!("\x1b[31m{:<10}\x1b[0m", "OFFLINE")
        };
        println!("{:<20} {}", name, status);
    }
    println!();
    Ok(())
}

async fn show_sync_status(client: &reqwest::Client, endpoint: &str, file: Option<&str>) -> anyhow::Result<()> {
    let print = |name: &str, status: &SyncStatus| {
        let state = if status.synced { "synced" } else { "pending" };
        let extra = if status.pending_operations { " (queued)" } else { "" };
        println!("{:<50} {:<8} {}{}", name, state, format_time(status.last_modified), extra);
    };

    match file {
        Some(name) => {
            let url = reqwest::Url::parse_with_params(
                &format!("{}/api/sync_status", endpoint),
                &[("filename", name)],
            )?;
            let status: SyncStatus = get_json(client, url.as_str()).await?;
            print(name, &status);
        }
        None => {
            let all: BTreeMap<String, SyncStatus> =
                get_json(client, &format!("{}/api/sync_status", endpoint)).await?;
            if all.is_empty() {
                println!("All files synced");
            }
            for (name, status) in &all {
                print(name, status);
            }
        }
    }
    Ok(())
}

async fn transfer(client: &reqwest::Client, endpoint: &str, file: &str, target: &str) -> anyhow::Result<()> {
    let ack = post_ack(
        client,
        &format!("{}/api/transfer", endpoint),
        serde_json::json!({"filename": file, "target_node": target}),
    )
    .await?;

    match ack.outcome.as_deref() {
        Some("queued") => println!("{} queued for {} (peer offline)", file, target),
        _ => println!("{} delivered to {}", file, target),
    }
    Ok(())
}

async fn delete(client: &reqwest::Client, endpoint: &str, file: &str) -> anyhow::Result<()> {
    post_ack(
        client,
        &format!("{}/api/delete", endpoint),
        serde_json::json!({"filename": file}),
    )
    .await?;
    println!("Deleted {}", file);
    Ok(())
}

async fn sync_now(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/api/sync", endpoint);
    let response = client.post(&url).send().await.with_context(|| format!("POST {}", url))?;
    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    let report: SyncResponse = response.json().await?;

    println!("Offline queue: {} applied, {} requeued", report.drained, report.requeued);
    match report.sync {
        Some(sync) => println!(
            "Sync pass: {} peer(s), {} applied, {} deferred",
            sync.peers, sync.applied, sync.deferred
        ),
        None => println!("Sync pass skipped (already running)"),
    }
    Ok(())
}
