//! Replication group assignment and the write/prepare/commit protocol.
//!
//! The primary storage node splits storage nodes into groups of
//! [`REPLICATION_GROUP_SIZE`] in arrival order and pushes the full
//! assignment table to every storage node. A node drives writes through the
//! group where it holds the `Writer` role and acknowledges writes for every
//! group it belongs to.

use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use litebase_core::clock::now_millis;
use litebase_core::retry::RetryPolicy;
use litebase_proto::constants::REPLICATION_GROUP_SIZE;
use litebase_proto::defaults::DEFAULT_QUORUM_POLL_MS;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{
    NodeMessage, ReplicationGroupAssignment, ReplicationGroupMember, ReplicationGroupPhaseMessage,
    ReplicationGroupRole, ReplicationGroupWriteMessage,
};
use litebase_proto::node::{NodeAddress, NodeType};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::group::ReplicationGroup;
use crate::context::NodeContext;

/// Timing knobs for the replication protocol.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
    pub quorum_ttl: Duration,
    pub quorum_wait: Duration,
    pub write_deadline: Duration,
}

#[derive(Default)]
struct GroupState {
    assignments: Vec<ReplicationGroupAssignment>,
    writer: Option<Arc<ReplicationGroup>>,
    observers: Vec<Arc<ReplicationGroup>>,
    assigned_at: Option<Instant>,
}

pub struct ReplicationGroupManager {
    node: Weak<dyn NodeContext>,
    config: ReplicationConfig,
    state: RwLock<GroupState>,
    cancel: CancellationToken,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Split `addresses` into groups of three. A short last group borrows
/// members of the first group as observers.
pub fn compute_assignments(addresses: &[NodeAddress]) -> Vec<ReplicationGroupAssignment> {
    let mut groups: Vec<Vec<ReplicationGroupMember>> = addresses
        .chunks(REPLICATION_GROUP_SIZE)
        .map(|chunk| {
            chunk
                .iter()
                .map(|address| ReplicationGroupMember {
                    address: address.clone(),
                    role: ReplicationGroupRole::Writer,
                })
                .collect()
        })
        .collect();

    if groups.len() > 1 {
        let first: Vec<NodeAddress> = groups[0].iter().map(|m| m.address.clone()).collect();
        if let Some(last) = groups.last_mut() {
            for address in first {
                if last.len() >= REPLICATION_GROUP_SIZE {
                    break;
                }
                if !last.iter().any(|m| m.address == address) {
                    last.push(ReplicationGroupMember {
                        address,
                        role: ReplicationGroupRole::Observer,
                    });
                }
            }
        }
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(i, members)| ReplicationGroupAssignment {
            group_id: i as u32 + 1,
            members,
        })
        .collect()
}

impl ReplicationGroupManager {
    pub fn new(
        node: Weak<dyn NodeContext>,
        config: ReplicationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            config,
            state: RwLock::new(GroupState::default()),
            cancel,
        }
    }

    fn node(&self) -> LbResult<Arc<dyn NodeContext>> {
        self.node.upgrade().ok_or(LbError::Cancelled)
    }

    pub fn assignments(&self) -> Vec<ReplicationGroupAssignment> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).assignments.clone()
    }

    pub fn writer_group(&self) -> Option<Arc<ReplicationGroup>> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).writer.clone()
    }

    pub fn observer_groups(&self) -> Vec<Arc<ReplicationGroup>> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).observers.clone()
    }

    fn group(&self, group_id: u32) -> LbResult<Arc<ReplicationGroup>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .writer
            .iter()
            .chain(state.observers.iter())
            .find(|g| g.id() == group_id)
            .cloned()
            .ok_or(LbError::ReplicationGroupNotFound)
    }

    fn assignment_age(&self) -> Option<Duration> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .assigned_at
            .map(|t| t.elapsed())
    }

    /// Replace the local groups with `assignments`.
    ///
    /// Groups whose id and members are unchanged keep their buffered writes.
    pub fn apply_assignments(&self, assignments: Vec<ReplicationGroupAssignment>) -> LbResult<()> {
        let node = self.node()?;
        let me = node.address();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous: Vec<Arc<ReplicationGroup>> = state
            .writer
            .iter()
            .chain(state.observers.iter())
            .cloned()
            .collect();
        let reuse = |assignment: &ReplicationGroupAssignment| -> Option<Arc<ReplicationGroup>> {
            if let Some(existing) = previous
                .iter()
                .find(|g| g.id() == assignment.group_id && g.members() == assignment.members.as_slice())
            {
                return Some(existing.clone());
            }
            ReplicationGroup::new(assignment, me).map(Arc::new)
        };

        let mut writer = None;
        let mut observers = Vec::new();
        for assignment in &assignments {
            match assignment.role_of(me) {
                Some(ReplicationGroupRole::Writer) => writer = reuse(assignment),
                Some(ReplicationGroupRole::Observer) => observers.extend(reuse(assignment)),
                None => {}
            }
        }

        debug!(
            "replication: {} applied {} group(s), writer={:?}, observing {}",
            me,
            assignments.len(),
            writer.as_ref().map(|g| g.id()),
            observers.len()
        );
        *state = GroupState {
            assignments,
            writer,
            observers,
            assigned_at: Some(Instant::now()),
        };
        Ok(())
    }

    /// Recompute groups from storage membership and push them to every
    /// storage node. Primary only.
    pub async fn assign_replication_groups(&self) -> LbResult<Vec<ReplicationGroupAssignment>> {
        let node = self.node()?;
        if !node.is_primary() {
            return Err(LbError::NotPrimary);
        }

        let members = node.members(NodeType::Storage).await?;
        let assignments = compute_assignments(&members);
        self.apply_assignments(assignments.clone())?;

        let msg = NodeMessage::ReplicationGroupAssignments {
            groups: assignments.clone(),
        };
        for peer in members.iter().filter(|a| *a != node.address()) {
            if let Err(e) = node.send(peer, msg.clone()).await {
                warn!("replication: failed to push assignments to {}: {}", peer, e);
            }
        }
        debug!(
            "replication: assigned {} storage node(s) to {} group(s)",
            members.len(),
            assignments.len()
        );
        Ok(assignments)
    }

    /// Re-push assignments once they are older than half the quorum TTL, so
    /// members never see them expire. No-op on non-primaries.
    pub async fn refresh_if_stale(&self) -> LbResult<()> {
        let node = self.node()?;
        if !node.is_primary() {
            return Ok(());
        }
        match self.assignment_age() {
            Some(age) if age < self.config.quorum_ttl / 2 => Ok(()),
            _ => self.assign_replication_groups().await.map(|_| ()),
        }
    }

    fn is_fresh(&self) -> bool {
        matches!(self.assignment_age(), Some(age) if age < self.config.quorum_ttl)
    }

    /// Checks at a fixed interval until `quorum_wait` has passed.
    fn quorum_retry(&self) -> RetryPolicy {
        let poll = Duration::from_millis(DEFAULT_QUORUM_POLL_MS).min(self.config.quorum_wait);
        let polls = self.config.quorum_wait.as_millis() / poll.as_millis().max(1);
        RetryPolicy::fixed(poll, polls as u32 + 1)
    }

    /// Ensure group membership is recent enough to run the protocol.
    pub async fn wait_for_quorum(&self) -> LbResult<()> {
        if self.is_fresh() {
            return Ok(());
        }

        let node = self.node()?;
        if node.is_primary() {
            self.assign_replication_groups().await?;
            return Ok(());
        }

        let waited = self
            .quorum_retry()
            .run(&self.cancel, |_| async move {
                if self.is_fresh() {
                    Ok(())
                } else {
                    Err(LbError::QuorumTimeout)
                }
            })
            .await;
        if waited == Err(LbError::QuorumTimeout) {
            warn!("replication: no fresh assignment within {:?}", self.config.quorum_wait);
        }
        waited
    }

    /// Send `msg` to every peer of `group`; the first failure fails the call.
    async fn broadcast(
        &self,
        node: &Arc<dyn NodeContext>,
        group: &ReplicationGroup,
        msg: NodeMessage,
        accept: fn(&NodeMessage) -> bool,
    ) -> LbResult<()> {
        let mut set = JoinSet::new();
        for peer in group.peers() {
            let node = node.clone();
            let msg = msg.clone();
            set.spawn(async move {
                let reply = node.send(&peer, msg).await;
                (peer, reply)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok((_, Ok(reply))) if accept(&reply) => Ok(()),
                Ok((peer, Ok(reply))) => {
                    warn!("replication: unexpected {} from {}", reply.kind(), peer);
                    Err(LbError::UnknownMessage)
                }
                Ok((peer, Err(e))) => {
                    warn!("replication: {} rejected {}: {}", peer, msg.kind(), e);
                    Err(e)
                }
                Err(_) => Err(LbError::Unknown),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn phase_message(
        group: &ReplicationGroup,
        write: &ReplicationGroupWriteMessage,
    ) -> ReplicationGroupPhaseMessage {
        ReplicationGroupPhaseMessage {
            group_id: group.id(),
            key: write.key.clone(),
            proposer: write.proposer.clone(),
            sha256: write.sha256.clone(),
        }
    }

    /// Propose `data` under `key` to the writer group.
    pub async fn write(&self, key: &str, data: Vec<u8>) -> LbResult<()> {
        self.wait_for_quorum().await?;
        let group = self.writer_group().ok_or(LbError::ReplicationGroupNotFound)?;
        let node = self.node()?;

        let msg = ReplicationGroupWriteMessage {
            group_id: group.id(),
            key: key.to_string(),
            addresses: group.addresses(),
            sha256: sha256_hex(&data),
            data,
            deadline: now_millis() + self.config.write_deadline.as_millis() as u64,
            proposer: node.address().clone(),
        };
        group.add_pending(msg.clone())?;

        let result = self
            .broadcast(&node, &group, NodeMessage::ReplicationGroupWrite(msg), |r| {
                matches!(r, NodeMessage::ReplicationGroupWriteAck { .. })
            })
            .await;
        if result.is_err() {
            group.remove_pending(key);
        }
        result
    }

    pub async fn prepare(&self, key: &str) -> LbResult<()> {
        self.wait_for_quorum().await?;
        let group = self.writer_group().ok_or(LbError::ReplicationGroupNotFound)?;
        let node = self.node()?;
        let write = group.pending(key).ok_or(LbError::ReplicatedWriteNotFound)?;

        let msg = NodeMessage::ReplicationGroupPrepare(Self::phase_message(&group, &write));
        self.broadcast(&node, &group, msg, |r| {
            matches!(r, NodeMessage::ReplicationGroupPrepareAck { .. })
        })
        .await
    }

    pub async fn commit(&self, key: &str) -> LbResult<()> {
        self.wait_for_quorum().await?;
        let group = self.writer_group().ok_or(LbError::ReplicationGroupNotFound)?;
        let node = self.node()?;
        let write = group.pending(key).ok_or(LbError::ReplicatedWriteNotFound)?;

        let msg = NodeMessage::ReplicationGroupCommit(Self::phase_message(&group, &write));
        self.broadcast(&node, &group, msg, |r| {
            matches!(r, NodeMessage::ReplicationGroupCommitAck { .. })
        })
        .await?;
        group.remove_pending(key);
        Ok(())
    }

    /// Run a full write, prepare and commit round for `key`.
    pub async fn replicate(&self, key: &str, data: Vec<u8>) -> LbResult<()> {
        self.write(key, data).await?;
        self.prepare(key).await?;
        self.commit(key).await
    }

    pub fn acknowledge_write(&self, msg: &ReplicationGroupWriteMessage) -> LbResult<()> {
        let group = self.group(msg.group_id)?;
        if sha256_hex(&msg.data) != msg.sha256 {
            return Err(LbError::Sha256Mismatch);
        }
        group.purge_expired(now_millis());
        group.acknowledge_write(msg)
    }

    pub fn acknowledge_prepare(&self, msg: &ReplicationGroupPhaseMessage) -> LbResult<()> {
        self.group(msg.group_id)?.acknowledge_prepare(msg)
    }

    pub fn acknowledge_commit(&self, msg: &ReplicationGroupPhaseMessage) -> LbResult<()> {
        self.group(msg.group_id)?.acknowledge_commit(msg)
    }

    /// Serve a replication message received from a peer.
    pub fn handle_message(&self, msg: NodeMessage) -> LbResult<NodeMessage> {
        match msg {
            NodeMessage::ReplicationGroupAssignments { groups } => {
                self.apply_assignments(groups)?;
                Ok(NodeMessage::Ack)
            }
            NodeMessage::ReplicationGroupWrite(write) => {
                self.acknowledge_write(&write)?;
                Ok(NodeMessage::ReplicationGroupWriteAck { key: write.key })
            }
            NodeMessage::ReplicationGroupPrepare(phase) => {
                self.acknowledge_prepare(&phase)?;
                Ok(NodeMessage::ReplicationGroupPrepareAck { key: phase.key })
            }
            NodeMessage::ReplicationGroupCommit(phase) => {
                self.acknowledge_commit(&phase)?;
                Ok(NodeMessage::ReplicationGroupCommitAck { key: phase.key })
            }
            _ => Err(LbError::UnknownMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryCluster;
    use async_trait::async_trait;
    use litebase_core::listener::MessageHandler;
    use litebase_proto::message::ConnectionRoute;

    struct Handler(Arc<ReplicationGroupManager>);

    #[async_trait]
    impl MessageHandler for Handler {
        async fn handle_message(
            &self,
            _route: ConnectionRoute,
            _peer: &NodeAddress,
            msg: NodeMessage,
        ) -> NodeMessage {
            self.0.handle_message(msg).unwrap_or_else(NodeMessage::error)
        }
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            quorum_ttl: Duration::from_secs(10),
            quorum_wait: Duration::from_millis(200),
            write_deadline: Duration::from_secs(30),
        }
    }

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    /// Start `n` storage nodes; the first one is primary.
    fn start(n: u16) -> (Arc<MemoryCluster>, Vec<Arc<ReplicationGroupManager>>) {
        let cluster = MemoryCluster::new();
        let mut managers = Vec::new();
        for i in 0..n {
            let node = cluster.add_node(addr(7000 + i), i == 0);
            let weak: Weak<dyn NodeContext> = Arc::downgrade(&node) as Weak<dyn NodeContext>;
            let manager = Arc::new(ReplicationGroupManager::new(
                weak,
                config(),
                CancellationToken::new(),
            ));
            cluster.register(addr(7000 + i), Arc::new(Handler(manager.clone())));
            managers.push(manager);
        }
        (cluster, managers)
    }

    #[test]
    fn test_compute_assignments_borrows_observers() {
        let addrs: Vec<_> = (0..5).map(|i| addr(7000 + i)).collect();
        let groups = compute_assignments(&addrs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].addresses(), addrs[..3].to_vec());
        assert_eq!(groups[1].members.len(), 3);
        assert_eq!(groups[1].role_of(&addrs[3]), Some(ReplicationGroupRole::Writer));
        assert_eq!(groups[1].role_of(&addrs[4]), Some(ReplicationGroupRole::Writer));
        assert_eq!(groups[1].role_of(&addrs[0]), Some(ReplicationGroupRole::Observer));

        let groups = compute_assignments(&addrs[..1]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 1);
        assert!(compute_assignments(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_assignments_pushed_to_every_node() {
        let (_cluster, managers) = start(4);
        managers[0].assign_replication_groups().await.unwrap();

        for manager in &managers {
            assert_eq!(manager.assignments().len(), 2);
            assert!(manager.writer_group().is_some());
        }
        // 7000 and 7001 are borrowed into the second group.
        assert_eq!(managers[0].observer_groups().len(), 1);
        assert_eq!(managers[0].observer_groups()[0].id(), 2);
        assert_eq!(managers[1].observer_groups().len(), 1);
        assert!(managers[2].observer_groups().is_empty());
        assert_eq!(managers[3].writer_group().unwrap().id(), 2);

        assert_eq!(
            managers[1].assign_replication_groups().await,
            Err(LbError::NotPrimary)
        );
    }

    #[tokio::test]
    async fn test_quorum_write_prepare_commit() {
        let (_cluster, managers) = start(3);
        managers[0].assign_replication_groups().await.unwrap();

        let writer = &managers[1];
        writer.write("k1", b"page-data".to_vec()).await.unwrap();
        let sha = sha256_hex(b"page-data");
        for peer in [&managers[0], &managers[2]] {
            let group = peer.writer_group().unwrap();
            let write = group.replicated_write("k1").unwrap();
            assert_eq!(write.sha256, sha);
            assert_eq!(write.prepared_at, 0);
            assert_eq!(write.proposer, addr(7001));
        }

        writer.prepare("k1").await.unwrap();
        for peer in [&managers[0], &managers[2]] {
            let write = peer.writer_group().unwrap().replicated_write("k1").unwrap();
            assert!(write.prepared_at > 0);
        }

        writer.commit("k1").await.unwrap();
        for peer in [&managers[0], &managers[2]] {
            assert!(peer.writer_group().unwrap().replicated_write("k1").is_none());
        }
        assert!(writer.writer_group().unwrap().pending("k1").is_none());
    }

    #[tokio::test]
    async fn test_single_member_group_is_durable_immediately() {
        let (_cluster, managers) = start(1);
        managers[0].replicate("k", b"x".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_write() {
        let (cluster, managers) = start(3);
        managers[0].assign_replication_groups().await.unwrap();
        cluster.set_down(&addr(7002), true);

        assert_eq!(
            managers[1].write("k", b"x".to_vec()).await,
            Err(LbError::NetworkError)
        );
        assert!(managers[1].writer_group().unwrap().pending("k").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_write_rejected() {
        let (_cluster, managers) = start(3);
        managers[0].assign_replication_groups().await.unwrap();
        managers[1].write("k", b"x".to_vec()).await.unwrap();
        assert_eq!(
            managers[1].write("k", b"x".to_vec()).await,
            Err(LbError::ReplicatedWriteExists)
        );
    }

    #[tokio::test]
    async fn test_corrupted_payload_rejected() {
        let (_cluster, managers) = start(3);
        managers[0].assign_replication_groups().await.unwrap();
        let group = managers[1].writer_group().unwrap();

        let msg = ReplicationGroupWriteMessage {
            group_id: group.id(),
            key: "k".into(),
            addresses: group.addresses(),
            data: b"tampered".to_vec(),
            deadline: now_millis() + 1_000,
            proposer: addr(7000),
            sha256: sha256_hex(b"original"),
        };
        assert_eq!(managers[1].acknowledge_write(&msg), Err(LbError::Sha256Mismatch));
        assert!(group.replicated_write("k").is_none());
    }

    #[tokio::test]
    async fn test_replica_waits_for_assignment() {
        let (_cluster, managers) = start(3);
        // Nothing assigned yet and the node is not primary.
        assert_eq!(managers[1].wait_for_quorum().await, Err(LbError::QuorumTimeout));

        let primary = managers[0].clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            primary.assign_replication_groups().await.unwrap();
        });
        managers[2].wait_for_quorum().await.unwrap();
    }

    #[tokio::test]
    async fn test_quorum_wait_stops_on_cancel() {
        let cluster = MemoryCluster::new();
        let node = cluster.add_node(addr(7050), false);
        let weak: Weak<dyn NodeContext> = Arc::downgrade(&node) as Weak<dyn NodeContext>;
        let cancel = CancellationToken::new();
        let mut slow = config();
        slow.quorum_wait = Duration::from_secs(30);
        let manager = ReplicationGroupManager::new(weak, slow, cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        assert_eq!(manager.wait_for_quorum().await, Err(LbError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_quorum_retry_spans_wait() {
        let (_cluster, managers) = start(1);
        let policy = managers[0].quorum_retry();
        assert_eq!(policy.backoff, Duration::from_millis(50));
        assert_eq!(policy.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_reassignment_keeps_buffered_writes() {
        let (_cluster, managers) = start(3);
        managers[0].assign_replication_groups().await.unwrap();
        managers[1].write("k", b"x".to_vec()).await.unwrap();

        managers[0].assign_replication_groups().await.unwrap();
        assert!(managers[2].writer_group().unwrap().replicated_write("k").is_some());
        managers[1].prepare("k").await.unwrap();
        managers[1].commit("k").await.unwrap();
    }
}
