use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use accord_node::api;
use accord_node::config::NodeConfig;
use accord_node::crypto::NodeIdentity;
use accord_node::network::{LocalNetwork, Network};
use accord_node::node::Node;

#[derive(Parser)]
#[command(author, version, about = "Distributed item-approval ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Bootstrap a fresh node: write a default configuration and generate
    /// its identity keypair
    Init {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Start { config } => start_node(config).await,
        Commands::Init { config, force } => init_node(config, force),
    }
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::load(&config_path).with_context(|| {
        format!(
            "cannot load {}; run `accord-node init` on a fresh node",
            config_path.display()
        )
    })?;

    let network = Arc::new(LocalNetwork::new(
        config.max_elections_time(),
        config.poll_interval(),
    ));
    let rpc_addr = config.rpc_listen;
    let node = Node::new(config, Arc::clone(&network) as Arc<dyn Network>)?;
    let handle = node.handle();
    network.register(&handle);

    let api_handle = handle.clone();
    let api_task = tokio::spawn(async move { api::serve(api_handle, rpc_addr).await });

    tokio::select! {
        served = api_task => {
            served??;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    handle.shutdown();
    Ok(())
}

/// A usable node needs both a configuration and an identity; write the two
/// together so `start` finds a complete installation.
fn init_node(config_path: PathBuf, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            config_path.display()
        );
    }
    let config = NodeConfig::default();
    config.save(&config_path)?;
    config.ensure_directories()?;
    let identity = NodeIdentity::open(&config.key_path)?;
    info!(
        config = %config_path.display(),
        address = %identity.address(),
        "node bootstrapped"
    );
    Ok(())
}
