//! Per-node pool of outbound connections.
//!
//! Owned by the node; one [`NodeConnection`] per `(peer, route)` pair is
//! created on first use and kept until the peer is removed or the pool is
//! closed on shutdown.

use std::sync::Arc;

use dashmap::DashMap;
use litebase_proto::error::LbResult;
use litebase_proto::message::{ConnectionRoute, NodeMessage};
use litebase_proto::node::NodeAddress;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{ConnectionConfig, NodeConnection};
use crate::signature::NodeSigner;

pub struct ConnectionPool {
    local: NodeAddress,
    signer: Arc<NodeSigner>,
    config: ConnectionConfig,
    cancel: CancellationToken,
    connections: DashMap<(NodeAddress, ConnectionRoute), Arc<NodeConnection>>,
}

impl ConnectionPool {
    pub fn new(
        local: NodeAddress,
        signer: Arc<NodeSigner>,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            signer,
            config,
            cancel,
            connections: DashMap::new(),
        }
    }

    /// Get the connection to `peer` on `route`, creating it if needed.
    pub fn get(&self, peer: &NodeAddress, route: ConnectionRoute) -> Arc<NodeConnection> {
        self.connections
            .entry((peer.clone(), route))
            .or_insert_with(|| {
                Arc::new(NodeConnection::new(
                    self.local.clone(),
                    peer.clone(),
                    route,
                    self.signer.clone(),
                    self.config,
                    self.cancel.child_token(),
                ))
            })
            .clone()
    }

    /// Send on the general connection route.
    pub async fn send(&self, peer: &NodeAddress, msg: &NodeMessage) -> LbResult<NodeMessage> {
        self.send_on(peer, ConnectionRoute::Connection, msg).await
    }

    pub async fn send_on(
        &self,
        peer: &NodeAddress,
        route: ConnectionRoute,
        msg: &NodeMessage,
    ) -> LbResult<NodeMessage> {
        let conn = self.get(peer, route);
        conn.send(msg).await
    }

    /// Forget every connection to `peer`.
    pub async fn remove(&self, peer: &NodeAddress) {
        let keys: Vec<_> = self
            .connections
            .iter()
            .filter(|entry| &entry.key().0 == peer)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                conn.close().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Cancel in-flight sends and drop every connection.
    pub async fn close_all(&self) {
        self.cancel.cancel();
        let conns: Vec<Arc<NodeConnection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        self.connections.clear();
        for conn in conns {
            conn.close().await;
        }
        debug!("connection pool: closed all connections of {}", self.local);
    }
}
