//! The slice of a node that replication groups and WAL managers depend on.
//!
//! Components hold a `Weak<dyn NodeContext>` back to their owning node, so
//! ownership runs one way and tests can substitute an in-memory cluster.

use async_trait::async_trait;
use litebase_proto::error::LbResult;
use litebase_proto::message::NodeMessage;
use litebase_proto::node::{NodeAddress, NodeType};

#[async_trait]
pub trait NodeContext: Send + Sync {
    fn address(&self) -> &NodeAddress;

    fn is_primary(&self) -> bool;

    /// Cluster members of `node_type`, including this node.
    async fn members(&self, node_type: NodeType) -> LbResult<Vec<NodeAddress>>;

    /// Send a message to a peer and return its reply.
    async fn send(&self, peer: &NodeAddress, msg: NodeMessage) -> LbResult<NodeMessage>;
}
