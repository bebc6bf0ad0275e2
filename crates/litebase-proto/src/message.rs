//! Node-to-node wire messages.
//!
//! Every frame on a node connection carries exactly one [`NodeMessage`].
//! The enum is closed: adding a kind forces every handler `match` to be
//! updated.

use serde::{Deserialize, Serialize};

use crate::error::{LbError, LbResult};
use crate::node::NodeAddress;
use crate::query::{DatabaseKey, QueryInput, QueryResponse};

/// Which endpoint a connection was opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRoute {
    /// General node-to-node messaging (heartbeats, replication, broadcasts).
    Connection,
    /// Messages that must be served by the primary (forwarded queries).
    Primary,
    /// Election confirmation requests.
    Election,
}

/// Role of a node inside one replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationGroupRole {
    /// Originates and drives writes for the group.
    Writer,
    /// Borrowed member that acknowledges writes to complete the group size.
    Observer,
}

/// One member of a replication group assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationGroupMember {
    pub address: NodeAddress,
    pub role: ReplicationGroupRole,
}

/// A replication group as computed by the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationGroupAssignment {
    pub group_id: u32,
    pub members: Vec<ReplicationGroupMember>,
}

impl ReplicationGroupAssignment {
    pub fn role_of(&self, address: &NodeAddress) -> Option<ReplicationGroupRole> {
        self.members
            .iter()
            .find(|m| &m.address == address)
            .map(|m| m.role)
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }
}

/// Primary heartbeat published to every other node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub address: NodeAddress,
    /// Lease expiry of the sending primary (unix ms).
    pub lease_expires_at: u64,
    pub timestamp: u64,
}

/// Request for a confirmation vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRequest {
    pub address: NodeAddress,
    /// Per-attempt nonce; never used to order candidates.
    pub seed: u64,
    /// The candidate's nomination timestamp (unix ns).
    pub timestamp: u64,
}

/// First phase of a replicated write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationGroupWriteMessage {
    pub group_id: u32,
    pub key: String,
    pub addresses: Vec<NodeAddress>,
    pub data: Vec<u8>,
    /// Unix ms after which the write is abandoned.
    pub deadline: u64,
    pub proposer: NodeAddress,
    pub sha256: String,
}

/// Prepare and commit phases carry only the identity of the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationGroupPhaseMessage {
    pub group_id: u32,
    pub key: String,
    pub proposer: NodeAddress,
    pub sha256: String,
}

/// WAL bytes written on the primary, replayed on replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalReplicationWriteMessage {
    pub database: DatabaseKey,
    pub timestamp: i64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub sha256: String,
}

/// WAL truncation on the primary, replayed on replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalReplicationTruncateMessage {
    pub database: DatabaseKey,
    pub timestamp: i64,
    pub size: u64,
}

/// Message kinds exchanged over a node connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Connection handshake, always the first frame on a stream.
    Connection {
        route: ConnectionRoute,
        header: String,
        timestamp: u64,
    },
    /// Handshake reply from the receiving node.
    ConnectionAck { address: NodeAddress },
    /// Plain acknowledgement for messages without a richer response.
    Ack,
    /// Structured failure; the connection stays open.
    Error { error: LbError, message: String },
    Heartbeat(HeartbeatMessage),
    Query(QueryInput),
    QueryResponse(QueryResponse),
    /// Cluster-wide event fan-out.
    Broadcast { key: String, value: String },
    ElectionRequest(ElectionRequest),
    ElectionVote { address: NodeAddress, granted: bool },
    ReplicationGroupAssignments { groups: Vec<ReplicationGroupAssignment> },
    ReplicationGroupWrite(ReplicationGroupWriteMessage),
    ReplicationGroupWriteAck { key: String },
    ReplicationGroupPrepare(ReplicationGroupPhaseMessage),
    ReplicationGroupPrepareAck { key: String },
    ReplicationGroupCommit(ReplicationGroupPhaseMessage),
    ReplicationGroupCommitAck { key: String },
    WalReplicationWrite(WalReplicationWriteMessage),
    WalReplicationTruncate(WalReplicationTruncateMessage),
    WalVersionUsageRequest { database: DatabaseKey },
    WalVersionUsageResponse {
        database: DatabaseKey,
        oldest_in_use: Option<i64>,
    },
    /// Sent by the primary after garbage collection: drop unread versions
    /// older than `before`.
    WalCollect { database: DatabaseKey, before: i64 },
}

impl NodeMessage {
    /// Short name of the message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::Connection { .. } => "connection",
            NodeMessage::ConnectionAck { .. } => "connection_ack",
            NodeMessage::Ack => "ack",
            NodeMessage::Error { .. } => "error",
            NodeMessage::Heartbeat(_) => "heartbeat",
            NodeMessage::Query(_) => "query",
            NodeMessage::QueryResponse(_) => "query_response",
            NodeMessage::Broadcast { .. } => "broadcast",
            NodeMessage::ElectionRequest(_) => "election_request",
            NodeMessage::ElectionVote { .. } => "election_vote",
            NodeMessage::ReplicationGroupAssignments { .. } => "replication_group_assignments",
            NodeMessage::ReplicationGroupWrite(_) => "replication_group_write",
            NodeMessage::ReplicationGroupWriteAck { .. } => "replication_group_write_ack",
            NodeMessage::ReplicationGroupPrepare(_) => "replication_group_prepare",
            NodeMessage::ReplicationGroupPrepareAck { .. } => "replication_group_prepare_ack",
            NodeMessage::ReplicationGroupCommit(_) => "replication_group_commit",
            NodeMessage::ReplicationGroupCommitAck { .. } => "replication_group_commit_ack",
            NodeMessage::WalReplicationWrite(_) => "wal_replication_write",
            NodeMessage::WalReplicationTruncate(_) => "wal_replication_truncate",
            NodeMessage::WalVersionUsageRequest { .. } => "wal_version_usage_request",
            NodeMessage::WalVersionUsageResponse { .. } => "wal_version_usage_response",
            NodeMessage::WalCollect { .. } => "wal_collect",
        }
    }

    /// Build an error reply.
    pub fn error(error: LbError) -> Self {
        NodeMessage::Error {
            error,
            message: error.to_string(),
        }
    }

    /// Turn an `Error` reply back into an `Err`, passing every other kind through.
    pub fn into_result(self) -> LbResult<NodeMessage> {
        match self {
            NodeMessage::Error { error, .. } => Err(error),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ColumnValue;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_error_reply_into_result() {
        let reply = NodeMessage::error(LbError::Sha256Mismatch);
        assert_eq!(reply.kind(), "error");
        assert_eq!(reply.into_result(), Err(LbError::Sha256Mismatch));

        let ok = NodeMessage::Ack.into_result().unwrap();
        assert_eq!(ok, NodeMessage::Ack);
    }

    #[test]
    fn test_assignment_role_lookup() {
        let assignment = ReplicationGroupAssignment {
            group_id: 1,
            members: vec![
                ReplicationGroupMember {
                    address: addr(7000),
                    role: ReplicationGroupRole::Writer,
                },
                ReplicationGroupMember {
                    address: addr(7001),
                    role: ReplicationGroupRole::Observer,
                },
            ],
        };
        assert_eq!(assignment.role_of(&addr(7000)), Some(ReplicationGroupRole::Writer));
        assert_eq!(assignment.role_of(&addr(7001)), Some(ReplicationGroupRole::Observer));
        assert_eq!(assignment.role_of(&addr(7002)), None);
        assert_eq!(assignment.addresses(), vec![addr(7000), addr(7001)]);
    }

    #[test]
    fn test_query_message_survives_bincode() {
        let msg = NodeMessage::Query(QueryInput {
            id: "q1".into(),
            access_key_id: "key".into(),
            database_hash: "hash".into(),
            database_id: "db".into(),
            branch_id: "main".into(),
            statement: "INSERT INTO t VALUES (?)".into(),
            parameters: vec![ColumnValue::Integer(7), ColumnValue::Null],
        });
        let encoded = bincode::serialize(&msg).unwrap();
        let decoded: NodeMessage = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_connection_key_is_hashable() {
        use std::collections::HashSet;

        let mut keys = HashSet::new();
        keys.insert((addr(7000), ConnectionRoute::Connection));
        keys.insert((addr(7000), ConnectionRoute::Primary));
        keys.insert((addr(7000), ConnectionRoute::Connection));
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&(addr(7000), ConnectionRoute::Primary)));
    }
}
