//! Keeps the WAL versions of query replicas in step with the primary.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{
    NodeMessage, WalReplicationTruncateMessage, WalReplicationWriteMessage,
};
use litebase_proto::node::{NodeAddress, NodeType};
use litebase_proto::query::DatabaseKey;
use tokio::task::JoinSet;
use tracing::warn;

use super::WalManagers;
use crate::context::NodeContext;
use crate::replication::manager::sha256_hex;

/// Where the page layer reports WAL mutations.
#[async_trait]
pub trait WalSynchronizer: Send + Sync {
    async fn write_at(
        &self,
        database: &DatabaseKey,
        timestamp: i64,
        offset: u64,
        data: &[u8],
    ) -> LbResult<()>;

    async fn truncate(&self, database: &DatabaseKey, timestamp: i64, size: u64) -> LbResult<()>;

    /// Versions with at least one local reader, oldest first.
    async fn get_active_wal_versions(&self, database: &DatabaseKey) -> LbResult<Vec<i64>>;
}

/// Applies WAL mutations locally and replays them on every other query node.
///
/// Replay is best effort: a failed peer is logged and the local write stands.
pub struct ClusterWalSynchronizer {
    node: Weak<dyn NodeContext>,
    managers: Arc<WalManagers>,
}

impl ClusterWalSynchronizer {
    pub fn new(node: Weak<dyn NodeContext>, managers: Arc<WalManagers>) -> Self {
        Self { node, managers }
    }

    async fn fan_out(&self, msg: NodeMessage) -> LbResult<usize> {
        let node = self.node.upgrade().ok_or(LbError::Cancelled)?;
        let peers: Vec<NodeAddress> = node
            .members(NodeType::Query)
            .await?
            .into_iter()
            .filter(|peer| peer != node.address())
            .collect();

        let mut tasks = JoinSet::new();
        for peer in peers {
            let node = node.clone();
            let msg = msg.clone();
            tasks.spawn(async move {
                let result = node.send(&peer, msg).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => delivered += 1,
                Ok((peer, Err(e))) => warn!("wal: replay to {} failed: {}", peer, e),
                Err(e) => warn!("wal: replay task failed: {}", e),
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl WalSynchronizer for ClusterWalSynchronizer {
    async fn write_at(
        &self,
        database: &DatabaseKey,
        timestamp: i64,
        offset: u64,
        data: &[u8],
    ) -> LbResult<()> {
        let manager = self.managers.get(database).await?;
        manager.apply_write(timestamp, offset, data).await?;
        self.fan_out(NodeMessage::WalReplicationWrite(WalReplicationWriteMessage {
            database: database.clone(),
            timestamp,
            offset,
            data: data.to_vec(),
            sha256: sha256_hex(data),
        }))
        .await?;
        Ok(())
    }

    async fn truncate(&self, database: &DatabaseKey, timestamp: i64, size: u64) -> LbResult<()> {
        let manager = self.managers.get(database).await?;
        manager.apply_truncate(timestamp, size).await?;
        self.fan_out(NodeMessage::WalReplicationTruncate(
            WalReplicationTruncateMessage {
                database: database.clone(),
                timestamp,
                size,
            },
        ))
        .await?;
        Ok(())
    }

    async fn get_active_wal_versions(&self, database: &DatabaseKey) -> LbResult<Vec<i64>> {
        Ok(self.managers.get(database).await?.active_versions().await)
    }
}
