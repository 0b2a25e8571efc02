//! WolfCluster - Leader Election and Shared Node State
//!
//! Demo binary: runs one or more nodes against an in-process
//! coordination store and logs every routine execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcluster::config::{ClusterMode, WolfClusterConfig};
use wolfcluster::node::{
    ClusterNode, ClusterNodeOptions, Node, NodeRoutines, RoutineFns, StandaloneNode,
};
use wolfcluster::store::MemoryStore;

/// WolfCluster - Leader Election and Shared Node State
#[derive(Parser)]
#[command(name = "wolfcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcluster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Run {
        /// Number of cluster nodes to run in this process
        #[arg(short, long, default_value_t = 1)]
        nodes: u32,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcluster.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value_t = 1)]
        node_id: i64,
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
        Commands::Run { nodes } => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            run(config, nodes).await
        }
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(output, node_id)
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

fn load_config(path: &Path) -> anyhow::Result<WolfClusterConfig> {
    WolfClusterConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

/// Routines that only log which role ran
fn logging_routines(node_id: i64) -> Arc<dyn NodeRoutines> {
    Arc::new(RoutineFns::new(
        move |_token: CancellationToken| async move {
            tracing::debug!(node_id, "Running leader routine");
            Ok(())
        },
        move |_token: CancellationToken| async move {
            tracing::debug!(node_id, "Running follower routine");
            Ok(())
        },
    ))
}

/// Run the configured nodes until Ctrl+C
async fn run(config: WolfClusterConfig, count: u32) -> anyhow::Result<()> {
    tracing::info!(
        "Starting WolfCluster node {} in {:?} mode",
        config.node.id,
        config.cluster.mode
    );

    let nodes: Vec<Arc<dyn Node>> = match config.cluster.mode {
        ClusterMode::Standalone => {
            let node = StandaloneNode::new(
                config.node.id,
                config.advertise_address(),
                config.tick(),
                logging_routines(config.node.id),
            );
            vec![Arc::new(node)]
        }
        ClusterMode::Cluster => {
            let store = MemoryStore::new();
            (0..count.max(1) as i64)
                .map(|offset| {
                    let id = config.node.id + offset;
                    let mut opts = ClusterNodeOptions::from_config(
                        &config,
                        Arc::new(store.clone()),
                        logging_routines(id),
                    );
                    opts.id = id;
                    Arc::new(ClusterNode::new(opts)) as Arc<dyn Node>
                })
                .collect()
        }
    };

    for node in &nodes {
        node.start();
    }

    tracing::info!("WolfCluster is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal, stopping...");

    for node in &nodes {
        if let Err(e) = node.close().await {
            tracing::warn!("Failed to close node {}: {}", node.get_self_metadata().id, e);
        }
    }

    tracing::info!("WolfCluster stopped");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: i64) -> anyhow::Result<()> {
    let config_content = format!(r#"# WolfCluster Configuration
# Generated configuration file

[node]
id = {node_id}
bind_address = "0.0.0.0:7654"
# advertise_address = "my-public-ip:7654"

[cluster]
name = "wolfcluster"
mode = "cluster"
# mode = "standalone"
lease_ttl_ms = 5000
tick_ms = 50
retry_floor_ms = 10
retry_ceiling_ms = 3000
session_retry_ceiling_ms = 1000

[store]
backend = "memory"
endpoints = []
# endpoints = ["store-1.example.com:2379", "store-2.example.com:2379"]
dial_timeout_ms = 3000
request_timeout_ms = 3000

[logging]
level = "info"
"#);

    // the template must stay loadable
    WolfClusterConfig::from_str(&config_content).context("Generated configuration is invalid")?;

    std::fs::write(&output, config_content)
        .with_context(|| format!("Failed to write {:?}", output))?;
    tracing::info!("Configuration written to {:?}", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Cluster: {} ({:?})", config.cluster.name, config.cluster.mode);
            println!("  Store: {} {:?}", config.store.backend, config.store.endpoints);
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
    let config = load_config(&config_path)?;

    println!("WolfCluster Node Information");
    println!("============================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Cluster Configuration:");
    println!("  Name:           {}", config.cluster.name);
    println!("  Mode:           {:?}", config.cluster.mode);
    println!("  Lease TTL:      {:?}", config.lease_ttl());
    println!("  Tick:           {:?}", config.tick());
    println!(
        "  Retry:          {} - {} ms",
        config.cluster.retry_floor_ms,
        config.cluster.retry_ceiling_ms
    );
    println!();
    println!("Store Configuration:");
    println!("  Backend:        {}", config.store.backend);
    println!("  Endpoints:      {:?}", config.store.endpoints);
    println!("  Dial Timeout:   {:?}", config.dial_timeout());
    println!("  Request:        {:?}", config.request_timeout());

    Ok(())
}
