//! One replication group as seen from a single member.
//!
//! The writer keeps its in-flight proposals in `pending_writes`; every
//! other member buffers what it acknowledged in `replicated_writes` until
//! the commit arrives. Phase checks (key present, proposer, SHA256, prepare
//! state) happen before any state changes, so a rejected message leaves
//! the group untouched.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use litebase_core::clock::now_millis;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{
    ReplicationGroupAssignment, ReplicationGroupMember, ReplicationGroupPhaseMessage,
    ReplicationGroupRole, ReplicationGroupWriteMessage,
};
use litebase_proto::node::NodeAddress;
use tracing::debug;

/// A write buffered on a non-proposing member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedWrite {
    pub addresses: Vec<NodeAddress>,
    pub data: Vec<u8>,
    /// Unix ms.
    pub deadline: u64,
    pub proposer: NodeAddress,
    pub sha256: String,
    /// Unix ms.
    pub replicated_at: u64,
    /// Unix ms; 0 until prepared.
    pub prepared_at: u64,
}

pub struct ReplicationGroup {
    id: u32,
    members: Vec<ReplicationGroupMember>,
    address: NodeAddress,
    role: ReplicationGroupRole,
    created_at: Instant,
    pending_writes: Mutex<HashMap<String, ReplicationGroupWriteMessage>>,
    replicated_writes: Mutex<HashMap<String, ReplicatedWrite>>,
}

impl ReplicationGroup {
    /// Build the local view of `assignment`; `None` if `address` is not a member.
    pub fn new(assignment: &ReplicationGroupAssignment, address: &NodeAddress) -> Option<Self> {
        let role = assignment.role_of(address)?;
        Some(Self {
            id: assignment.group_id,
            members: assignment.members.clone(),
            address: address.clone(),
            role,
            created_at: Instant::now(),
            pending_writes: Mutex::new(HashMap::new()),
            replicated_writes: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> ReplicationGroupRole {
        self.role
    }

    pub fn members(&self) -> &[ReplicationGroupMember] {
        &self.members
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    /// Every member except this node.
    pub fn peers(&self) -> Vec<NodeAddress> {
        self.members
            .iter()
            .filter(|m| m.address != self.address)
            .map(|m| m.address.clone())
            .collect()
    }

    pub fn add_pending(&self, msg: ReplicationGroupWriteMessage) -> LbResult<()> {
        let mut pending = self.pending_writes.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&msg.key) {
            return Err(LbError::ReplicatedWriteExists);
        }
        pending.insert(msg.key.clone(), msg);
        Ok(())
    }

    pub fn pending(&self, key: &str) -> Option<ReplicationGroupWriteMessage> {
        self.pending_writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn remove_pending(&self, key: &str) -> Option<ReplicationGroupWriteMessage> {
        self.pending_writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub fn replicated_write(&self, key: &str) -> Option<ReplicatedWrite> {
        self.replicated_writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn replicated_len(&self) -> usize {
        self.replicated_writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Buffer a write proposed by another member.
    pub fn acknowledge_write(&self, msg: &ReplicationGroupWriteMessage) -> LbResult<()> {
        let mut writes = self.replicated_writes.lock().unwrap_or_else(|e| e.into_inner());
        if writes.contains_key(&msg.key) {
            return Err(LbError::ReplicatedWriteExists);
        }
        writes.insert(
            msg.key.clone(),
            ReplicatedWrite {
                addresses: msg.addresses.clone(),
                data: msg.data.clone(),
                deadline: msg.deadline,
                proposer: msg.proposer.clone(),
                sha256: msg.sha256.clone(),
                replicated_at: now_millis(),
                prepared_at: 0,
            },
        );
        debug!("replication: group {} buffered {}", self.id, msg.key);
        Ok(())
    }

    fn verify(write: &ReplicatedWrite, msg: &ReplicationGroupPhaseMessage) -> LbResult<()> {
        if write.proposer != msg.proposer {
            return Err(LbError::ProposerMismatch);
        }
        if write.sha256 != msg.sha256 {
            return Err(LbError::Sha256Mismatch);
        }
        Ok(())
    }

    pub fn acknowledge_prepare(&self, msg: &ReplicationGroupPhaseMessage) -> LbResult<()> {
        let mut writes = self.replicated_writes.lock().unwrap_or_else(|e| e.into_inner());
        let write = writes
            .get_mut(&msg.key)
            .ok_or(LbError::ReplicatedWriteNotFound)?;
        Self::verify(write, msg)?;
        if write.prepared_at != 0 {
            return Err(LbError::AlreadyPrepared);
        }
        write.prepared_at = now_millis().max(1);
        debug!("replication: group {} prepared {}", self.id, msg.key);
        Ok(())
    }

    pub fn acknowledge_commit(&self, msg: &ReplicationGroupPhaseMessage) -> LbResult<()> {
        let mut writes = self.replicated_writes.lock().unwrap_or_else(|e| e.into_inner());
        let write = writes.get(&msg.key).ok_or(LbError::ReplicatedWriteNotFound)?;
        Self::verify(write, msg)?;
        if write.prepared_at == 0 {
            return Err(LbError::NotPrepared);
        }
        writes.remove(&msg.key);
        debug!("replication: group {} committed {}", self.id, msg.key);
        Ok(())
    }

    /// Drop buffered writes whose deadline has passed. Returns how many.
    pub fn purge_expired(&self, now: u64) -> usize {
        let mut writes = self.replicated_writes.lock().unwrap_or_else(|e| e.into_inner());
        let before = writes.len();
        writes.retain(|_, w| w.deadline > now);
        before - writes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    fn assignment() -> ReplicationGroupAssignment {
        ReplicationGroupAssignment {
            group_id: 1,
            members: vec![
                ReplicationGroupMember { address: addr(7000), role: ReplicationGroupRole::Writer },
                ReplicationGroupMember { address: addr(7001), role: ReplicationGroupRole::Writer },
                ReplicationGroupMember { address: addr(7002), role: ReplicationGroupRole::Observer },
            ],
        }
    }

    fn write(key: &str) -> ReplicationGroupWriteMessage {
        ReplicationGroupWriteMessage {
            group_id: 1,
            key: key.into(),
            addresses: vec![addr(7000), addr(7001), addr(7002)],
            data: b"page".to_vec(),
            deadline: now_millis() + 30_000,
            proposer: addr(7000),
            sha256: "abc".into(),
        }
    }

    fn phase(key: &str, proposer: NodeAddress, sha256: &str) -> ReplicationGroupPhaseMessage {
        ReplicationGroupPhaseMessage {
            group_id: 1,
            key: key.into(),
            proposer,
            sha256: sha256.into(),
        }
    }

    #[test]
    fn test_local_view() {
        assert!(ReplicationGroup::new(&assignment(), &addr(7009)).is_none());
        let group = ReplicationGroup::new(&assignment(), &addr(7002)).unwrap();
        assert_eq!(group.role(), ReplicationGroupRole::Observer);
        assert_eq!(group.peers(), vec![addr(7000), addr(7001)]);
    }

    #[test]
    fn test_write_prepare_commit() {
        let group = ReplicationGroup::new(&assignment(), &addr(7001)).unwrap();
        group.acknowledge_write(&write("k")).unwrap();
        assert_eq!(group.acknowledge_write(&write("k")), Err(LbError::ReplicatedWriteExists));
        assert_eq!(group.replicated_write("k").unwrap().prepared_at, 0);

        let ok = phase("k", addr(7000), "abc");
        assert_eq!(group.acknowledge_commit(&ok), Err(LbError::NotPrepared));
        group.acknowledge_prepare(&ok).unwrap();
        assert!(group.replicated_write("k").unwrap().prepared_at > 0);
        assert_eq!(group.acknowledge_prepare(&ok), Err(LbError::AlreadyPrepared));

        group.acknowledge_commit(&ok).unwrap();
        assert!(group.replicated_write("k").is_none());
        assert_eq!(group.acknowledge_commit(&ok), Err(LbError::ReplicatedWriteNotFound));
    }

    #[test]
    fn test_mismatches_leave_state_unchanged() {
        let group = ReplicationGroup::new(&assignment(), &addr(7001)).unwrap();
        group.acknowledge_write(&write("k")).unwrap();
        let before = group.replicated_write("k").unwrap();

        assert_eq!(
            group.acknowledge_prepare(&phase("k", addr(7002), "abc")),
            Err(LbError::ProposerMismatch)
        );
        assert_eq!(
            group.acknowledge_prepare(&phase("k", addr(7000), "bad")),
            Err(LbError::Sha256Mismatch)
        );
        assert_eq!(group.replicated_write("k").unwrap(), before);

        group.acknowledge_prepare(&phase("k", addr(7000), "abc")).unwrap();
        assert_eq!(
            group.acknowledge_commit(&phase("k", addr(7000), "bad")),
            Err(LbError::Sha256Mismatch)
        );
        assert!(group.replicated_write("k").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let group = ReplicationGroup::new(&assignment(), &addr(7001)).unwrap();
        let mut stale = write("old");
        stale.deadline = 10;
        group.acknowledge_write(&stale).unwrap();
        group.acknowledge_write(&write("new")).unwrap();
        assert_eq!(group.purge_expired(now_millis()), 1);
        assert_eq!(group.replicated_len(), 1);
    }
}
