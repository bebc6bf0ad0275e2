//! Cluster-wide events.
//!
//! Handlers subscribe to a key and run for every local delivery. A
//! broadcast delivers locally and then sends `NodeMessage::Broadcast` to
//! each peer, whose node delivers it to its own subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use litebase_core::connection_pool::ConnectionPool;
use litebase_proto::message::NodeMessage;
use litebase_proto::node::NodeAddress;
use tracing::{debug, warn};

pub type EventHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct Events {
    handlers: DashMap<String, Vec<EventHandler>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, key: &str, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.handlers
            .entry(key.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Run the local subscribers of `key`. Returns how many ran.
    pub fn deliver(&self, key: &str, value: &str) -> usize {
        // Clone out so handlers may subscribe without deadlocking the map.
        let handlers: Vec<EventHandler> = match self.handlers.get(key) {
            Some(list) => list.clone(),
            None => return 0,
        };
        debug!("events: delivering {} to {} handler(s)", key, handlers.len());
        for handler in &handlers {
            handler(value);
        }
        handlers.len()
    }

    /// Deliver locally, then fan out to `peers`. Returns the peers that failed.
    pub async fn broadcast(
        &self,
        key: &str,
        value: &str,
        pool: &ConnectionPool,
        peers: &[NodeAddress],
    ) -> Vec<NodeAddress> {
        self.deliver(key, value);

        let msg = NodeMessage::Broadcast {
            key: key.to_string(),
            value: value.to_string(),
        };
        let mut failed = Vec::new();
        for peer in peers {
            if let Err(e) = pool.send(peer, &msg).await {
                warn!("events: broadcast of {} to {} failed: {}", key, peer, e);
                failed.push(peer.clone());
            }
        }
        failed
    }
}
