//! Bring a node up from its configuration.

use std::sync::Arc;

use litebase_core::file_store::{FileSystem, LocalFileSystem};
use litebase_core::net::create_listen_socket;
use litebase_proto::error::LbResult;
use tracing::info;

use crate::config::{ensure_cluster_config, NodeConfig};
use crate::node::Node;
use crate::query::QueryBuilder;

/// Check the shared store, bind the listener and start a node.
///
/// With `port == 0` the node advertises the port the OS picked.
pub async fn start_node(config: NodeConfig, builder: Arc<dyn QueryBuilder>) -> LbResult<Arc<Node>> {
    let shared: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(&config.shared_path));
    let cluster = ensure_cluster_config(shared.as_ref(), &config.cluster_id).await?;
    info!("cluster {} (created {})", cluster.cluster_id, cluster.created_at);

    let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(&config.data_path));
    local.mkdir_all("").await?;

    let listener = create_listen_socket(&config.listen_addr()).await?;
    let port = listener.local_addr()?.port();
    let address = config.advertised_address(port);

    let node = Node::new(config, address, shared, local, builder);
    node.start(listener).await?;
    Ok(node)
}
