//! In-memory cluster for exercising components without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use litebase_core::listener::MessageHandler;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{ConnectionRoute, NodeMessage};
use litebase_proto::node::{NodeAddress, NodeType};

use crate::context::NodeContext;

pub struct MemoryNode {
    address: NodeAddress,
    primary: AtomicBool,
    cluster: Weak<MemoryCluster>,
}

impl MemoryNode {
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeContext for MemoryNode {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    async fn members(&self, _node_type: NodeType) -> LbResult<Vec<NodeAddress>> {
        let cluster = self.cluster.upgrade().ok_or(LbError::Cancelled)?;
        Ok(cluster.addresses())
    }

    async fn send(&self, peer: &NodeAddress, msg: NodeMessage) -> LbResult<NodeMessage> {
        let cluster = self.cluster.upgrade().ok_or(LbError::Cancelled)?;
        cluster.deliver(&self.address, peer, msg).await
    }
}

/// Routes messages between registered handlers in the order nodes were added.
#[derive(Default)]
pub struct MemoryCluster {
    nodes: Mutex<Vec<Arc<MemoryNode>>>,
    handlers: DashMap<NodeAddress, Arc<dyn MessageHandler>>,
    down: DashSet<NodeAddress>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(self: &Arc<Self>, address: NodeAddress, primary: bool) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode {
            address,
            primary: AtomicBool::new(primary),
            cluster: Arc::downgrade(self),
        });
        self.nodes.lock().unwrap().push(node.clone());
        node
    }

    pub fn register(&self, address: NodeAddress, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(address, handler);
    }

    pub fn set_down(&self, address: &NodeAddress, down: bool) {
        if down {
            self.down.insert(address.clone());
        } else {
            self.down.remove(address);
        }
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.address.clone())
            .collect()
    }

    async fn deliver(
        &self,
        from: &NodeAddress,
        to: &NodeAddress,
        msg: NodeMessage,
    ) -> LbResult<NodeMessage> {
        if self.down.contains(to) {
            return Err(LbError::NetworkError);
        }
        let handler = self
            .handlers
            .get(to)
            .map(|h| h.value().clone())
            .ok_or(LbError::NetworkError)?;
        handler
            .handle_message(ConnectionRoute::Connection, from, msg)
            .await
            .into_result()
    }
}
