//! ringkv server.
//!
//! One process, one ring position: an in-memory quorum-replicated key-value
//! node, or (with `--statsrv`) the cluster's status report collector.

use clap::Parser;
use ringkv::config::Config;
use ringkv::node::{self, NodeRuntime};
use std::path::PathBuf;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ringkv", version, about = "Replicated key-value store node")]
struct Args {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Host the server on localhost
    #[arg(long)]
    loopback: bool,

    /// Port to run the server on
    #[arg(short, long, default_value = "5555")]
    port: u16,

    /// Randomly drop this percentage of incoming packets
    #[arg(long, default_value = "0")]
    lossy: u8,

    /// Path to the config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Run as the status report collector instead of a store node
    #[arg(long)]
    statsrv: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "ringkv=debug" } else { "ringkv=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .init();

    let config = match Config::load_or_default(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("config error: {e}");
            std::process::exit(1);
        }
    };

    info!("ringkv v{VERSION}");

    if args.statsrv {
        if let Err(e) = node::run_status_server(&config).await {
            error!("status server failed: {e}");
            std::process::exit(2);
        }
        return;
    }

    let node = match NodeRuntime::bind(config, args.port, args.loopback, args.lossy).await {
        Ok(n) => n,
        Err(e) => {
            error!("failed to bind node socket: {e}");
            std::process::exit(2);
        }
    };
    node.start().await;

    tokio::signal::ctrl_c().await.ok();
    info!("interrupted, shutting down");
    node.shutdown().await;
}
