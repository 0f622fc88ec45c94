//! dkg-node: standalone knowledge-graph node
//!
//! Runs the operation pipeline against in-process collaborators and serves
//! the client API over HTTP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use dkg_node::api::create_router;
use dkg_node::{Config, NodeBuilder};

#[derive(Parser)]
#[command(name = "dkg-node")]
#[command(about = "Protocol operation pipeline for a decentralized knowledge-graph node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dkg-node.toml", env = "DKG_CONFIG")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "DKG_DATA_DIR")]
    data_dir: Option<String>,

    /// Peer ID (overrides config file)
    #[arg(long, env = "DKG_PEER_ID")]
    peer_id: Option<String>,

    /// HTTP API port (overrides config file)
    #[arg(long, env = "DKG_HTTP_PORT")]
    http_port: Option<u16>,

    /// Keep all state in memory
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dkg_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting dkg-node");
    info!("Config file: {}", cli.config);

    let mut config = if Path::new(&cli.config).exists() {
        Config::load(Path::new(&cli.config))
            .with_context(|| format!("loading {}", cli.config))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(peer_id) = cli.peer_id {
        config.node.peer_id = peer_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!("Peer ID: {}", config.node.peer_id);
    info!("Data dir: {}", config.node.data_dir.display());

    let mut builder = NodeBuilder::new(config.clone());
    if cli.in_memory {
        builder = builder.in_memory();
    }
    let node = builder.start().context("starting node")?;

    let app = create_router(node.context().clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    node.shutdown().await;
    Ok(())
}
