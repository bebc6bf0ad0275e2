//! Role objects attached to a node while it is primary or replica.
//!
//! Each role owns a child cancellation token. Switching roles stops the old
//! one, which aborts whatever it still has in flight.

use std::sync::Arc;

use litebase_core::clock::now_millis;
use litebase_core::connection_pool::ConnectionPool;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{ConnectionRoute, HeartbeatMessage, NodeMessage};
use litebase_proto::node::NodeAddress;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PrimaryRole {
    address: NodeAddress,
    cancel: CancellationToken,
}

impl PrimaryRole {
    pub fn new(address: NodeAddress, cancel: CancellationToken) -> Self {
        Self { address, cancel }
    }

    /// Send a heartbeat to every peer. Returns how many acknowledged it.
    pub async fn publish_heartbeat(
        &self,
        pool: &Arc<ConnectionPool>,
        peers: &[NodeAddress],
        lease_expires_at: u64,
    ) -> usize {
        let msg = NodeMessage::Heartbeat(HeartbeatMessage {
            address: self.address.clone(),
            lease_expires_at,
            timestamp: now_millis(),
        });

        let mut tasks = JoinSet::new();
        for peer in peers.iter().filter(|p| **p != self.address) {
            let pool = pool.clone();
            let peer = peer.clone();
            let msg = msg.clone();
            tasks.spawn(async move {
                let result = pool.send(&peer, &msg).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((_, Ok(_)))) => delivered += 1,
                    Some(Ok((peer, Err(e)))) => debug!("heartbeat: {} unreachable: {}", peer, e),
                    Some(Err(_)) => {}
                    None => break,
                },
            }
        }
        delivered
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct ReplicaRole {
    cancel: CancellationToken,
}

impl ReplicaRole {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Send `msg` to `primary` over the primary route.
    pub async fn send_to_primary(
        &self,
        pool: &ConnectionPool,
        primary: &NodeAddress,
        msg: &NodeMessage,
    ) -> LbResult<NodeMessage> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LbError::Cancelled),
            reply = pool.send_on(primary, ConnectionRoute::Primary, msg) => reply,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The role a node currently plays; stand-by nodes have none.
pub enum NodeRole {
    Primary(Arc<PrimaryRole>),
    Replica(Arc<ReplicaRole>),
}

impl NodeRole {
    pub fn stop(&self) {
        match self {
            NodeRole::Primary(role) => role.stop(),
            NodeRole::Replica(role) => role.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use litebase_core::connection::ConnectionConfig;
    use litebase_core::listener::{serve, ListenerContext, MessageHandler};
    use litebase_core::net::create_listen_socket;
    use litebase_core::signature::NodeSigner;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ConnectionRoute, String)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(
            &self,
            route: ConnectionRoute,
            _peer: &NodeAddress,
            msg: NodeMessage,
        ) -> NodeMessage {
            self.seen.lock().unwrap().push((route, msg.kind().to_string()));
            NodeMessage::Ack
        }
    }

    async fn listen(signer: Arc<NodeSigner>, recorder: Arc<Recorder>) -> (NodeAddress, CancellationToken) {
        let listener = create_listen_socket("127.0.0.1:0").await.unwrap();
        let address = NodeAddress::new("127.0.0.1", listener.local_addr().unwrap().port());
        let cancel = CancellationToken::new();
        let ctx = ListenerContext {
            local: address.clone(),
            signer,
            handler: recorder,
            inactivity_timeout: Duration::from_secs(5),
        };
        tokio::spawn(serve(listener, ctx, cancel.clone()));
        (address, cancel)
    }

    fn pool(signer: Arc<NodeSigner>) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            NodeAddress::new("127.0.0.1", 1),
            signer,
            ConnectionConfig::default(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_live_peers() {
        let signer = Arc::new(NodeSigner::new("secret"));
        let recorder = Arc::new(Recorder::default());
        let (peer, stop) = listen(signer.clone(), recorder.clone()).await;
        let self_addr = NodeAddress::new("127.0.0.1", 1);
        let dead = NodeAddress::new("127.0.0.1", 9);

        let role = PrimaryRole::new(self_addr.clone(), CancellationToken::new());
        let pool = pool(signer);
        let delivered = role
            .publish_heartbeat(&pool, &[self_addr, peer, dead], now_millis() + 1_000)
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            &[(ConnectionRoute::Connection, "heartbeat".to_string())]
        );
        stop.cancel();
    }

    #[tokio::test]
    async fn test_replica_uses_primary_route() {
        let signer = Arc::new(NodeSigner::new("secret"));
        let recorder = Arc::new(Recorder::default());
        let (primary, stop) = listen(signer.clone(), recorder.clone()).await;

        let role = ReplicaRole::new(CancellationToken::new());
        let pool = pool(signer);
        let reply = role
            .send_to_primary(&pool, &primary, &NodeMessage::Ack)
            .await
            .unwrap();
        assert_eq!(reply, NodeMessage::Ack);
        assert_eq!(recorder.seen.lock().unwrap()[0].0, ConnectionRoute::Primary);

        role.stop();
        assert!(role.is_stopped());
        assert_eq!(
            role.send_to_primary(&pool, &primary, &NodeMessage::Ack).await,
            Err(LbError::Cancelled)
        );
        stop.cancel();
    }
}
