//! Versioned write-ahead logs.
//!
//! Each database branch keeps its WAL versions under
//! `<database>/<branch>/wal/<timestamp>` in the node's local store, with the
//! known versions listed in `wal/INDEX`. A version's timestamp (unix ms) is
//! its identity; once checkpointed it never changes.

pub mod manager;
pub mod synchronizer;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use litebase_core::file_store::FileSystem;
use litebase_proto::constants::{WAL_DIR, WAL_INDEX_FILE};
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::NodeMessage;
use litebase_proto::query::DatabaseKey;

use crate::context::NodeContext;
use crate::replication::manager::sha256_hex;

pub use manager::DatabaseWalManager;
pub use synchronizer::{ClusterWalSynchronizer, WalSynchronizer};

pub(crate) fn wal_dir(key: &DatabaseKey) -> String {
    format!("{}/{}/{}", key.database_id, key.branch_id, WAL_DIR)
}

pub(crate) fn wal_index_path(key: &DatabaseKey) -> String {
    format!("{}/{}", wal_dir(key), WAL_INDEX_FILE)
}

/// One WAL version of one database branch.
pub struct DatabaseWal {
    key: DatabaseKey,
    timestamp: i64,
    path: String,
    store: Arc<dyn FileSystem>,
    /// Unix ms; 0 until checkpointed.
    checkpointed_at: AtomicI64,
}

impl DatabaseWal {
    pub fn new(store: Arc<dyn FileSystem>, key: DatabaseKey, timestamp: i64) -> Self {
        let path = format!("{}/{}", wal_dir(&key), timestamp);
        Self {
            key,
            timestamp,
            path,
            store,
            checkpointed_at: AtomicI64::new(0),
        }
    }

    pub fn key(&self) -> &DatabaseKey {
        &self.key
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn checkpointed_at(&self) -> i64 {
        self.checkpointed_at.load(Ordering::SeqCst)
    }

    pub fn is_checkpointed(&self) -> bool {
        self.checkpointed_at() != 0
    }

    pub(crate) fn mark_checkpointed(&self, at: i64) {
        self.checkpointed_at.store(at.max(1), Ordering::SeqCst);
    }

    /// Create the backing file, empty.
    pub async fn create(&self) -> LbResult<()> {
        self.store.write_file(&self.path, &[]).await
    }

    pub async fn exists(&self) -> bool {
        self.store.stat(&self.path).await.is_ok()
    }

    pub async fn size(&self) -> LbResult<u64> {
        match self.store.stat(&self.path).await {
            Ok(info) => Ok(info.size),
            Err(LbError::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self) -> LbResult<Vec<u8>> {
        self.store.read_file(&self.path).await
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> LbResult<()> {
        if self.is_checkpointed() {
            return Err(LbError::AlreadyCheckpointed);
        }
        self.store.write_at(&self.path, offset, data).await
    }

    pub async fn truncate(&self, size: u64) -> LbResult<()> {
        if self.is_checkpointed() {
            return Err(LbError::AlreadyCheckpointed);
        }
        match self.store.truncate(&self.path, size).await {
            Err(LbError::NotFound) => {
                self.store.write_at(&self.path, 0, &[]).await?;
                self.store.truncate(&self.path, size).await
            }
            other => other,
        }
    }

    pub(crate) async fn remove(&self) -> LbResult<()> {
        match self.store.remove(&self.path).await {
            Ok(()) | Err(LbError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// WAL managers of every database branch on this node, opened on first use.
pub struct WalManagers {
    store: Arc<dyn FileSystem>,
    node: Weak<dyn NodeContext>,
    managers: DashMap<DatabaseKey, Arc<DatabaseWalManager>>,
}

impl WalManagers {
    pub fn new(store: Arc<dyn FileSystem>, node: Weak<dyn NodeContext>) -> Self {
        Self {
            store,
            node,
            managers: DashMap::new(),
        }
    }

    pub async fn get(&self, key: &DatabaseKey) -> LbResult<Arc<DatabaseWalManager>> {
        if let Some(manager) = self.managers.get(key) {
            return Ok(manager.value().clone());
        }
        let opened = Arc::new(
            DatabaseWalManager::open(self.store.clone(), key.clone(), self.node.clone()).await?,
        );
        Ok(self
            .managers
            .entry(key.clone())
            .or_insert(opened)
            .value()
            .clone())
    }

    pub fn keys(&self) -> Vec<DatabaseKey> {
        self.managers.iter().map(|e| e.key().clone()).collect()
    }

    /// Collect garbage on every open database branch. Returns versions removed.
    pub async fn run_garbage_collection(&self) -> LbResult<usize> {
        let mut removed = 0;
        for key in self.keys() {
            removed += self.get(&key).await?.run_garbage_collection().await?.len();
        }
        Ok(removed)
    }

    /// Serve a WAL message received from a peer.
    pub async fn handle_message(&self, msg: NodeMessage) -> LbResult<NodeMessage> {
        match msg {
            NodeMessage::WalReplicationWrite(write) => {
                if sha256_hex(&write.data) != write.sha256 {
                    return Err(LbError::Sha256Mismatch);
                }
                let manager = self.get(&write.database).await?;
                manager
                    .apply_write(write.timestamp, write.offset, &write.data)
                    .await?;
                Ok(NodeMessage::Ack)
            }
            NodeMessage::WalReplicationTruncate(truncate) => {
                let manager = self.get(&truncate.database).await?;
                manager
                    .apply_truncate(truncate.timestamp, truncate.size)
                    .await?;
                Ok(NodeMessage::Ack)
            }
            NodeMessage::WalVersionUsageRequest { database } => {
                let manager = self.get(&database).await?;
                Ok(NodeMessage::WalVersionUsageResponse {
                    oldest_in_use: manager.oldest_in_use().await,
                    database,
                })
            }
            NodeMessage::WalCollect { database, before } => {
                self.get(&database).await?.collect_below(before).await?;
                Ok(NodeMessage::Ack)
            }
            _ => Err(LbError::UnknownMessage),
        }
    }
}
