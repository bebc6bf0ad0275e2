//! Cluster node state machine.
//!
//! A node starts in `StandBy`, settles as `Replica` after its first tick and
//! becomes `Primary` by winning an election over the shared lease. All
//! membership transitions run under `transition`, so a tick, an inbound
//! heartbeat from a rival primary and shutdown never interleave.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use litebase_core::clock::now_millis;
use litebase_core::connection_pool::ConnectionPool;
use litebase_core::file_store::FileSystem;
use litebase_core::listener::{serve, ListenerContext, MessageHandler};
use litebase_core::retry::RetryPolicy;
use litebase_core::signature::NodeSigner;
use litebase_proto::constants::{
    EVENT_ACTIVATE_SIGNATURE, EVENT_CLUSTER_JOIN, EVENT_CLUSTER_LEAVE, EVENT_NEXT_SIGNATURE,
};
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{ConnectionRoute, HeartbeatMessage, NodeMessage};
use litebase_proto::node::{NodeAddress, NodeMembership, NodeType};
use litebase_proto::query::{QueryInput, QueryResponse};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::election::{grant_vote, strategy_for, ElectionContext, ElectionStrategy, NominationRecord};
use crate::events::Events;
use crate::lease::Lease;
use crate::membership::Membership;
use crate::query::{PrimaryForwarder, QueryBuilder, QueryResolver};
use crate::replication::{ReplicationConfig, ReplicationGroupManager};
use crate::roles::{NodeRole, PrimaryRole, ReplicaRole};
use crate::wal::{ClusterWalSynchronizer, WalManagers};
use crate::write_queue::WriteQueueManager;

#[derive(Debug, Clone, Copy)]
struct HeartbeatReceipt {
    received_at: Instant,
    lease_expires_at: u64,
}

#[derive(Debug, Clone)]
struct NodeStatus {
    membership: NodeMembership,
    primary_address: Option<NodeAddress>,
    last_heartbeat: Option<HeartbeatReceipt>,
    /// Unix ms of the last tick.
    last_active: u64,
}

pub struct Node {
    config: NodeConfig,
    address: NodeAddress,
    membership: Arc<Membership>,
    events: Arc<Events>,
    signer: Arc<NodeSigner>,
    pool: Arc<ConnectionPool>,
    lease: Lease,
    record: NominationRecord,
    election: Box<dyn ElectionStrategy>,
    retry: RetryPolicy,
    transition: tokio::sync::Mutex<()>,
    status: RwLock<NodeStatus>,
    role: Mutex<Option<NodeRole>>,
    replication: ReplicationGroupManager,
    wal: Arc<WalManagers>,
    synchronizer: ClusterWalSynchronizer,
    resolver: QueryResolver,
    last_wal_gc: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Node {
    /// Build a node. `shared` is the cluster-wide store, `local` holds this
    /// node's WAL versions.
    pub fn new(
        config: NodeConfig,
        address: NodeAddress,
        shared: Arc<dyn FileSystem>,
        local: Arc<dyn FileSystem>,
        builder: Arc<dyn QueryBuilder>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Node>| {
            let context: Weak<dyn NodeContext> = weak.clone();
            let cancel = CancellationToken::new();
            let signer = Arc::new(NodeSigner::new(config.signature.clone()));
            let pool = Arc::new(ConnectionPool::new(
                address.clone(),
                signer.clone(),
                config.connection,
                cancel.child_token(),
            ));
            let membership = Arc::new(Membership::new(shared.clone(), config.membership_cache));
            let events = Arc::new(Events::new());
            Self::subscribe(&events, weak, &membership, &signer);

            let lease = Lease::new(
                shared.clone(),
                address.clone(),
                config.node_type,
                config.lease_duration,
                config.lease_renewal_margin,
            );
            let record = NominationRecord::new(shared, config.node_type, config.nomination_ttl);
            let replication = ReplicationGroupManager::new(
                context.clone(),
                ReplicationConfig {
                    quorum_ttl: config.quorum_ttl,
                    quorum_wait: config.quorum_wait,
                    write_deadline: config.replicated_write_deadline,
                },
                cancel.child_token(),
            );
            let wal = Arc::new(WalManagers::new(local, context.clone()));
            let synchronizer = ClusterWalSynchronizer::new(context, wal.clone());
            let queues = Arc::new(WriteQueueManager::new(
                config.write_queue_capacity,
                config.write_queue_idle,
                cancel.child_token(),
            ));

            Node {
                election: strategy_for(config.election),
                retry: RetryPolicy::fixed(config.election_backoff, config.election_max_attempts),
                address,
                membership,
                events,
                signer,
                pool,
                lease,
                record,
                transition: tokio::sync::Mutex::new(()),
                status: RwLock::new(NodeStatus {
                    membership: NodeMembership::StandBy,
                    primary_address: None,
                    last_heartbeat: None,
                    last_active: 0,
                }),
                role: Mutex::new(None),
                replication,
                wal,
                synchronizer,
                resolver: QueryResolver::new(builder, queues),
                last_wal_gc: Mutex::new(Instant::now()),
                cancel,
                config,
            }
        })
    }

    fn subscribe(
        events: &Events,
        node: &Weak<Node>,
        membership: &Arc<Membership>,
        signer: &Arc<NodeSigner>,
    ) {
        for key in [EVENT_CLUSTER_JOIN, EVENT_CLUSTER_LEAVE] {
            let node = node.clone();
            let membership = membership.clone();
            events.subscribe(key, move |value| {
                debug!("node: membership changed ({})", value);
                membership.invalidate();
                let Some(node) = node.upgrade() else { return };
                if node.config.node_type == NodeType::Storage && node.is_primary() {
                    tokio::spawn(async move {
                        if let Err(e) = node.replication.assign_replication_groups().await {
                            warn!("node: reassigning replication groups failed: {}", e);
                        }
                    });
                }
            });
        }

        let next = signer.clone();
        events.subscribe(EVENT_NEXT_SIGNATURE, move |value| next.set_next(value));
        let active = signer.clone();
        events.subscribe(EVENT_ACTIVATE_SIGNATURE, move |value| active.activate(value));
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn membership(&self) -> NodeMembership {
        self.status().membership
    }

    pub fn is_primary(&self) -> bool {
        self.membership() == NodeMembership::Primary
    }

    /// The primary this node last learned of.
    pub fn primary_address(&self) -> Option<NodeAddress> {
        self.status().primary_address
    }

    /// Unix ms of the last heartbeat tick.
    pub fn last_active(&self) -> u64 {
        self.status().last_active
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn events(&self) -> &Arc<Events> {
        &self.events
    }

    pub fn cluster_members(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn replication(&self) -> &ReplicationGroupManager {
        &self.replication
    }

    pub fn wal(&self) -> &Arc<WalManagers> {
        &self.wal
    }

    pub fn wal_synchronizer(&self) -> &ClusterWalSynchronizer {
        &self.synchronizer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn status(&self) -> NodeStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_status<F: FnOnce(&mut NodeStatus)>(&self, f: F) {
        f(&mut self.status.write().unwrap_or_else(|e| e.into_inner()));
    }

    fn role(&self) -> Option<NodeRole> {
        match &*self.role.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(NodeRole::Primary(role)) => Some(NodeRole::Primary(role.clone())),
            Some(NodeRole::Replica(role)) => Some(NodeRole::Replica(role.clone())),
            None => None,
        }
    }

    /// Enter `next`. Re-entering the current membership only refreshes
    /// bookkeeping.
    fn set_membership(&self, next: NodeMembership) {
        let previous = self.membership();
        self.update_status(|status| {
            status.membership = next;
            match next {
                NodeMembership::Primary => status.primary_address = Some(self.address.clone()),
                _ if previous == NodeMembership::Primary => status.primary_address = None,
                _ => {}
            }
        });
        if next != NodeMembership::Primary {
            self.lease.reset();
        }
        if previous == next && (next == NodeMembership::StandBy || self.role().is_some()) {
            return;
        }

        let role = match next {
            NodeMembership::Primary => Some(NodeRole::Primary(Arc::new(PrimaryRole::new(
                self.address.clone(),
                self.cancel.child_token(),
            )))),
            NodeMembership::Replica => Some(NodeRole::Replica(Arc::new(ReplicaRole::new(
                self.cancel.child_token(),
            )))),
            NodeMembership::StandBy => None,
        };
        let old = std::mem::replace(&mut *self.role.lock().unwrap_or_else(|e| e.into_inner()), role);
        if let Some(old) = old {
            old.stop();
        }
        info!("node: {} {} -> {}", self.address, previous, next);
    }

    fn demote(&self, reason: &str) {
        warn!("node: {} stepping down: {}", self.address, reason);
        self.set_membership(NodeMembership::Replica);
    }

    async fn peers(&self, node_type: NodeType) -> Vec<NodeAddress> {
        match self.membership.members(node_type).await {
            Ok(members) => members.into_iter().filter(|a| *a != self.address).collect(),
            Err(e) => {
                warn!("node: cannot list {} members: {}", node_type, e);
                Vec::new()
            }
        }
    }

    async fn all_peers(&self) -> Vec<NodeAddress> {
        match self.membership.all_members().await {
            Ok(members) => members.into_iter().filter(|a| *a != self.address).collect(),
            Err(e) => {
                warn!("node: cannot list members: {}", e);
                Vec::new()
            }
        }
    }

    /// Deliver an event locally and to every other cluster member.
    pub async fn broadcast(&self, key: &str, value: &str) -> Vec<NodeAddress> {
        let peers = self.all_peers().await;
        self.events.broadcast(key, value, &self.pool, &peers).await
    }

    /// One pass of the heartbeat loop.
    pub async fn tick(&self) {
        let _guard = self.transition.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }
        let now = now_millis();
        self.update_status(|status| status.last_active = now);
        if self.is_primary() {
            self.tick_primary(now).await;
        } else {
            self.tick_follower(now).await;
        }
    }

    async fn tick_primary(&self, now: u64) {
        match self.lease.read_primary().await {
            Ok(Some(primary)) if primary == self.address => {}
            Ok(other) => {
                let holder = other.map_or_else(|| "nobody".to_string(), |a| a.to_string());
                self.demote(&format!("primary pointer names {}", holder));
                return;
            }
            Err(e) => {
                self.demote(&format!("primary pointer unreadable: {}", e));
                return;
            }
        }

        if self.lease.needs_renewal(now) {
            let renewed = self
                .retry
                .run_if(
                    &self.cancel,
                    |e| e != LbError::LeaseVerificationFailed,
                    |_| self.lease.renew(now_millis()),
                )
                .await;
            if let Err(e) = renewed {
                self.demote(&format!("lease renewal failed: {}", e));
                return;
            }
        } else {
            self.publish_heartbeat().await;
        }

        match self.config.node_type {
            NodeType::Storage => {
                if let Err(e) = self.replication.refresh_if_stale().await {
                    warn!("node: replication refresh failed: {}", e);
                }
            }
            NodeType::Query => self.maybe_collect_wal(),
        }
    }

    async fn publish_heartbeat(&self) {
        let Some(NodeRole::Primary(role)) = self.role() else {
            return;
        };
        let peers = self.peers(self.config.node_type).await;
        let delivered = role
            .publish_heartbeat(&self.pool, &peers, self.lease.expires_at())
            .await;
        debug!("node: heartbeat reached {}/{} peer(s)", delivered, peers.len());
    }

    fn maybe_collect_wal(&self) {
        {
            let mut last = self.last_wal_gc.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < self.config.wal_gc_interval {
                return;
            }
            *last = Instant::now();
        }
        let wal = self.wal.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = wal.run_garbage_collection() => match result {
                    Ok(0) => {}
                    Ok(removed) => info!("node: wal collection removed {} version(s)", removed),
                    Err(e) => warn!("node: wal collection failed: {}", e),
                },
            }
        });
    }

    async fn tick_follower(&self, now: u64) {
        let status = self.status();
        if let Some(heartbeat) = status.last_heartbeat {
            if heartbeat.received_at.elapsed() < self.config.heartbeat_validity
                && heartbeat.lease_expires_at > now
                && status.primary_address.is_some()
            {
                self.set_membership(NodeMembership::Replica);
                return;
            }
        }

        match self.lease.current_primary(now).await {
            Ok(Some((primary, _))) if primary != self.address => {
                self.update_status(|status| status.primary_address = Some(primary));
                self.set_membership(NodeMembership::Replica);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("node: cannot read lease: {}", e);
                return;
            }
        }

        self.update_status(|status| {
            status.primary_address = None;
            status.last_heartbeat = None;
        });
        self.run_election().await;
    }

    async fn run_election(&self) {
        let members = match self.membership.members(self.config.node_type).await {
            Ok(members) => members,
            Err(e) => {
                warn!("node: cannot list members for election: {}", e);
                vec![self.address.clone()]
            }
        };
        let ctx = ElectionContext {
            address: &self.address,
            lease: &self.lease,
            record: &self.record,
            members: &members,
            pool: &self.pool,
            timeout: self.config.election_timeout,
        };

        debug!("node: {} running {} election", self.address, self.election.name());
        match self.retry.run(&self.cancel, |_| self.election.run(&ctx)).await {
            Ok(true) => self.promote().await,
            Ok(false) => self.set_membership(NodeMembership::Replica),
            Err(e) => {
                warn!("node: election failed: {}", e);
                self.set_membership(NodeMembership::Replica);
            }
        }
    }

    async fn promote(&self) {
        if let Err(e) = self.lease.claim_primary(now_millis()).await {
            warn!("node: cannot claim primary pointer: {}", e);
            self.set_membership(NodeMembership::Replica);
            return;
        }
        if let Err(e) = self.lease.renew(now_millis()).await {
            warn!("node: initial lease renewal failed: {}", e);
            self.set_membership(NodeMembership::Replica);
            return;
        }
        if let Err(e) = self.record.clear().await {
            warn!("node: cannot clear nomination record: {}", e);
        }

        self.set_membership(NodeMembership::Primary);
        info!("node: {} elected {} primary", self.address, self.config.node_type);
        self.publish_heartbeat().await;

        if self.config.node_type == NodeType::Storage {
            if let Err(e) = self.replication.assign_replication_groups().await {
                warn!("node: initial replication assignment failed: {}", e);
            }
        }
    }

    async fn record_heartbeat(&self, heartbeat: HeartbeatMessage) {
        if heartbeat.address == self.address {
            return;
        }
        if self.is_primary() {
            // Two primaries: whoever the pointer does not name steps down.
            // A busy transition lock means a tick is running and will check
            // the pointer itself.
            let Ok(_guard) = self.transition.try_lock() else {
                return;
            };
            match self.lease.read_primary().await {
                Ok(Some(primary)) if primary == self.address => return,
                Ok(_) => self.demote(&format!("heartbeat from primary {}", heartbeat.address)),
                Err(e) => {
                    self.demote(&format!("primary pointer unreadable: {}", e));
                    return;
                }
            }
        }
        self.update_status(|status| {
            status.primary_address = Some(heartbeat.address.clone());
            status.last_heartbeat = Some(HeartbeatReceipt {
                received_at: Instant::now(),
                lease_expires_at: heartbeat.lease_expires_at,
            });
        });
    }

    /// Run a client query, forwarding writes to the primary when needed.
    pub async fn resolve_query(&self, input: QueryInput) -> LbResult<QueryResponse> {
        self.resolver.resolve(self, input).await
    }

    async fn dispatch(&self, route: ConnectionRoute, msg: NodeMessage) -> LbResult<NodeMessage> {
        match msg {
            NodeMessage::Heartbeat(heartbeat) => {
                self.record_heartbeat(heartbeat).await;
                Ok(NodeMessage::Ack)
            }
            NodeMessage::Broadcast { key, value } => {
                self.events.deliver(&key, &value);
                Ok(NodeMessage::Ack)
            }
            NodeMessage::ElectionRequest(request) => {
                if route != ConnectionRoute::Election {
                    return Err(LbError::UnknownMessage);
                }
                let granted = grant_vote(&self.lease, &self.record, &request)
                    .await
                    .unwrap_or(false);
                debug!(
                    "node: vote for {} {}",
                    request.address,
                    if granted { "granted" } else { "refused" }
                );
                Ok(NodeMessage::ElectionVote {
                    address: self.address.clone(),
                    granted,
                })
            }
            NodeMessage::Query(input) => Ok(NodeMessage::QueryResponse(
                self.resolver.resolve_forwarded(self, input).await?,
            )),
            msg @ (NodeMessage::ReplicationGroupAssignments { .. }
            | NodeMessage::ReplicationGroupWrite(_)
            | NodeMessage::ReplicationGroupPrepare(_)
            | NodeMessage::ReplicationGroupCommit(_)) => self.replication.handle_message(msg),
            msg @ (NodeMessage::WalReplicationWrite(_)
            | NodeMessage::WalReplicationTruncate(_)
            | NodeMessage::WalVersionUsageRequest { .. }
            | NodeMessage::WalCollect { .. }) => self.wal.handle_message(msg).await,
            NodeMessage::Connection { .. }
            | NodeMessage::ConnectionAck { .. }
            | NodeMessage::Ack
            | NodeMessage::Error { .. }
            | NodeMessage::QueryResponse(_)
            | NodeMessage::ElectionVote { .. }
            | NodeMessage::ReplicationGroupWriteAck { .. }
            | NodeMessage::ReplicationGroupPrepareAck { .. }
            | NodeMessage::ReplicationGroupCommitAck { .. }
            | NodeMessage::WalVersionUsageResponse { .. } => Err(LbError::UnknownMessage),
        }
    }

    /// Join the cluster and start serving `listener` and the heartbeat loop.
    pub async fn start(self: &Arc<Self>, listener: TcpListener) -> LbResult<()> {
        self.membership
            .join(self.config.node_type, &self.address)
            .await?;

        let ctx = ListenerContext {
            local: self.address.clone(),
            signer: self.signer.clone(),
            handler: self.clone(),
            inactivity_timeout: self.config.connection.inactivity_timeout,
        };
        tokio::spawn(serve(listener, ctx, self.cancel.child_token()));

        let failed = self.broadcast(EVENT_CLUSTER_JOIN, self.address.as_str()).await;
        if !failed.is_empty() {
            debug!("node: join not delivered to {} peer(s)", failed.len());
        }

        let node = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(node) = node.upgrade() else { break };
                        node.tick().await;
                    }
                }
            }
            debug!("node: heartbeat loop stopped");
        });

        info!(
            "node: {} started as {} node ({} election)",
            self.address,
            self.config.node_type,
            self.election.name()
        );
        Ok(())
    }

    /// Leave the cluster cleanly.
    pub async fn shutdown(&self) {
        let _guard = self.transition.lock().await;
        if self.is_primary() {
            if let Err(e) = self.lease.release().await {
                error!("node: failed to release lease: {}", e);
            }
        }
        self.set_membership(NodeMembership::StandBy);

        self.broadcast(EVENT_CLUSTER_LEAVE, self.address.as_str()).await;
        if let Err(e) = self
            .membership
            .leave(self.config.node_type, &self.address)
            .await
        {
            warn!("node: failed to remove presence marker: {}", e);
        }
        self.pool.close_all().await;
        self.cancel.cancel();
        info!("node: {} shut down", self.address);
    }

    /// Stop every task without releasing anything, as a crash would.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle_message(
        &self,
        route: ConnectionRoute,
        peer: &NodeAddress,
        msg: NodeMessage,
    ) -> NodeMessage {
        let kind = msg.kind();
        self.dispatch(route, msg).await.unwrap_or_else(|e| {
            debug!("node: {} from {} failed: {}", kind, peer, e);
            NodeMessage::error(e)
        })
    }
}

#[async_trait]
impl NodeContext for Node {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn is_primary(&self) -> bool {
        Node::is_primary(self)
    }

    async fn members(&self, node_type: NodeType) -> LbResult<Vec<NodeAddress>> {
        self.membership.members(node_type).await
    }

    async fn send(&self, peer: &NodeAddress, msg: NodeMessage) -> LbResult<NodeMessage> {
        self.pool.send(peer, &msg).await
    }
}

#[async_trait]
impl PrimaryForwarder for Node {
    fn is_primary(&self) -> bool {
        Node::is_primary(self)
    }

    async fn forward_to_primary(&self, msg: NodeMessage) -> LbResult<NodeMessage> {
        let primary = match self.primary_address() {
            Some(primary) => primary,
            None => match self.lease.current_primary(now_millis()).await? {
                Some((primary, _)) => primary,
                None => return Err(LbError::NoPrimaryAvailable),
            },
        };
        if primary == self.address {
            return Err(LbError::NoPrimaryAvailable);
        }
        match self.role() {
            Some(NodeRole::Replica(role)) => role.send_to_primary(&self.pool, &primary, &msg).await,
            _ => Err(LbError::NoPrimaryAvailable),
        }
    }
}
