//! Ember node binary.
//!
//! Runs one node until SIGINT/SIGTERM, then shuts down gracefully. Exit
//! code 0 on a clean stop, nonzero on a fatal initialization error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use ember::config::{Config, NodeType};
use ember::node::Node;

#[derive(Parser, Debug)]
#[command(
    name = "ember",
    version,
    about = "Ember P2P node - popularity-aware Kademlia DHT",
    long_about = None
)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the node type from the config file
    #[arg(long, value_enum)]
    node_type: Option<NodeType>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("ember v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(node_type) = args.node_type {
        config.node.node_type = node_type;
    }

    let node = Arc::new(Node::new(config).await?);
    node.start().await;

    wait_for_shutdown().await;

    node.stop().await;
    info!("shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
