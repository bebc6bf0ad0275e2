//! Async TCP helpers for node-to-node connections.

use std::time::Duration;

use litebase_proto::error::{LbError, LbResult};
use litebase_proto::node::NodeAddress;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a remote node, failing after `timeout`.
pub async fn connect_to(addr: &NodeAddress, timeout: Duration) -> LbResult<TcpStream> {
    debug!("connecting to {}", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| LbError::ConnectionTimeout)?
        .map_err(|_| LbError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create a TCP listener on the given address.
pub async fn create_listen_socket(addr: &str) -> LbResult<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        LbError::NetworkError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}
