//! Apiary daemon: runs one storage node.
//!
//! Loads or creates a node identity in the data directory, joins the
//! overlay and serves chunks until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use apiary_net::{Node, NodeConfig};

/// Apiary storage node.
#[derive(Parser)]
#[command(name = "apiaryd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory holding identity, chunks and node records
    #[arg(short, long, default_value = "~/.apiary")]
    datadir: PathBuf,

    /// Listening port for a freshly created identity
    #[arg(short, long, default_value_t = 8500)]
    port: u16,

    /// Nodes to dial at startup, as host:port
    #[arg(short, long)]
    connect: Vec<String>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log: String,
}

fn expand_tilde(path: &PathBuf) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    let datadir = expand_tilde(&cli.datadir);
    let config =
        NodeConfig::load_or_create(&datadir, cli.port).context("loading node configuration")?;
    let node = Node::start(config).await.context("starting node")?;

    for url in &cli.connect {
        node.connect(url.clone());
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received");
    node.shutdown().await;
    Ok(())
}
