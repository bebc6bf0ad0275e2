//! Litebase cluster node (litebase).
//!
//! Usage:
//!   litebase --cluster-id <ID> [OPTIONS]
//!
//! The node joins the cluster recorded in the shared store, takes part in
//! primary election for its node type and serves other nodes until it
//! receives Ctrl-C, when it leaves the cluster cleanly.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use litebase_proto::error::LbError;
use litebase_server::config::{Args, NodeConfig};
use litebase_server::query::DetachedQueryBuilder;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("litebase v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match NodeConfig::from_args(&args) {
        Ok(config) => config,
        Err(LbError::MissingClusterId) => {
            error!("a cluster id is required (--cluster-id or LITEBASE_CLUSTER_ID)");
            std::process::exit(1);
        }
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let node = match litebase_server::start_node(config, Arc::new(DetachedQueryBuilder)).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {}", e);
            std::process::exit(1);
        }
    };
    info!("litebase ready on {}", node.address());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
    node.shutdown().await;
}
