use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Weak};

use litebase_core::clock::now_millis;
use litebase_core::file_store::FileSystem;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::NodeMessage;
use litebase_proto::node::{NodeAddress, NodeType};
use litebase_proto::query::DatabaseKey;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{wal_index_path, DatabaseWal};
use crate::context::NodeContext;

#[derive(Default)]
struct WalState {
    versions: BTreeMap<i64, Arc<DatabaseWal>>,
    usage: HashMap<i64, u32>,
    last_checkpointed: Option<i64>,
}

impl WalState {
    fn latest(&self) -> Option<i64> {
        self.versions.keys().next_back().copied()
    }

    fn oldest_in_use(&self) -> Option<i64> {
        self.usage
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(ts, _)| *ts)
            .min()
    }
}

/// Tracks the WAL versions of one database branch and who is reading them.
pub struct DatabaseWalManager {
    key: DatabaseKey,
    store: Arc<dyn FileSystem>,
    node: Weak<dyn NodeContext>,
    state: Mutex<WalState>,
    checkpoint_lock: Mutex<()>,
}

impl DatabaseWalManager {
    /// Open the manager, reloading known versions from the persisted index.
    pub async fn open(
        store: Arc<dyn FileSystem>,
        key: DatabaseKey,
        node: Weak<dyn NodeContext>,
    ) -> LbResult<Self> {
        let mut state = WalState::default();
        match store.read_file(&wal_index_path(&key)).await {
            Ok(data) => {
                for line in String::from_utf8_lossy(&data).lines() {
                    match line.trim().parse::<i64>() {
                        Ok(ts) => {
                            let wal = DatabaseWal::new(store.clone(), key.clone(), ts);
                            state.versions.insert(ts, Arc::new(wal));
                        }
                        Err(_) if line.trim().is_empty() => {}
                        Err(_) => warn!("wal: {} ignoring bad index line {:?}", key, line),
                    }
                }
            }
            Err(LbError::NotFound) => {}
            Err(e) => return Err(e),
        }
        debug!("wal: opened {} with {} versions", key, state.versions.len());
        Ok(Self {
            key,
            store,
            node,
            state: Mutex::new(state),
            checkpoint_lock: Mutex::new(()),
        })
    }

    pub fn key(&self) -> &DatabaseKey {
        &self.key
    }

    fn node(&self) -> LbResult<Arc<dyn NodeContext>> {
        self.node.upgrade().ok_or(LbError::Cancelled)
    }

    async fn persist_index(&self, state: &WalState) -> LbResult<()> {
        let body = state
            .versions
            .keys()
            .map(|ts| ts.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        self.store
            .write_file(&wal_index_path(&self.key), body.as_bytes())
            .await
    }

    async fn insert_version(&self, state: &mut WalState, ts: i64) -> LbResult<Arc<DatabaseWal>> {
        let wal = Arc::new(DatabaseWal::new(self.store.clone(), self.key.clone(), ts));
        wal.create().await?;
        state.versions.insert(ts, wal.clone());
        if let Err(e) = self.persist_index(state).await {
            state.versions.remove(&ts);
            let _ = wal.remove().await;
            return Err(e);
        }
        Ok(wal)
    }

    /// Allocate a new, empty version stamped with the current time.
    pub async fn create(&self) -> LbResult<Arc<DatabaseWal>> {
        if !self.node()?.is_primary() {
            return Err(LbError::CreateWalVersionOnReplica);
        }
        let mut state = self.state.lock().await;
        let now = now_millis() as i64;
        let ts = match state.latest() {
            Some(latest) => now.max(latest + 1),
            None => now,
        };
        let wal = self.insert_version(&mut state, ts).await?;
        info!("wal: {} created version {}", self.key, ts);
        Ok(wal)
    }

    /// The closest version at or before `timestamp` that is not checkpointed,
    /// creating one at `timestamp` when none qualifies.
    pub async fn get(&self, timestamp: i64) -> LbResult<Arc<DatabaseWal>> {
        let mut state = self.state.lock().await;
        if let Some(wal) = state.versions.get(&timestamp) {
            return Ok(wal.clone());
        }
        if let Some((_, wal)) = state.versions.range(..=timestamp).next_back() {
            if !wal.is_checkpointed() {
                return Ok(wal.clone());
            }
        }
        let wal = self.insert_version(&mut state, timestamp).await?;
        debug!("wal: {} opened version {} on access", self.key, timestamp);
        Ok(wal)
    }

    /// The version stamped exactly `timestamp`, created when missing.
    ///
    /// Replicated mutations must land in the version the primary wrote, so
    /// they resolve through this rather than [`get`](Self::get).
    pub async fn version(&self, timestamp: i64) -> LbResult<Arc<DatabaseWal>> {
        let mut state = self.state.lock().await;
        if let Some(wal) = state.versions.get(&timestamp) {
            return Ok(wal.clone());
        }
        let wal = self.insert_version(&mut state, timestamp).await?;
        debug!("wal: {} opened replicated version {}", self.key, timestamp);
        Ok(wal)
    }

    pub async fn latest(&self) -> Option<Arc<DatabaseWal>> {
        let state = self.state.lock().await;
        state.versions.values().next_back().cloned()
    }

    pub async fn versions(&self) -> Vec<i64> {
        self.state.lock().await.versions.keys().copied().collect()
    }

    /// Register one more reader of `timestamp`.
    pub async fn acquire(&self, timestamp: i64) -> LbResult<u32> {
        let mut state = self.state.lock().await;
        if !state.versions.contains_key(&timestamp) {
            return Err(LbError::WalVersionNotFound);
        }
        let count = state.usage.entry(timestamp).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    pub async fn release(&self, timestamp: i64) -> LbResult<u32> {
        let mut state = self.state.lock().await;
        let count = state
            .usage
            .get_mut(&timestamp)
            .ok_or(LbError::WalVersionNotFound)?;
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            state.usage.remove(&timestamp);
        }
        Ok(remaining)
    }

    pub async fn usage(&self, timestamp: i64) -> u32 {
        self.state
            .lock()
            .await
            .usage
            .get(&timestamp)
            .copied()
            .unwrap_or(0)
    }

    /// Oldest version with at least one reader on this node.
    pub async fn oldest_in_use(&self) -> Option<i64> {
        self.state.lock().await.oldest_in_use()
    }

    /// Versions with at least one reader on this node, oldest first.
    pub async fn active_versions(&self) -> Vec<i64> {
        let state = self.state.lock().await;
        let mut active: Vec<i64> = state
            .usage
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(ts, _)| *ts)
            .collect();
        active.sort_unstable();
        active
    }

    /// Delete every version older than the oldest one still read anywhere
    /// among the query nodes. Returns the removed timestamps.
    pub async fn run_garbage_collection(&self) -> LbResult<Vec<i64>> {
        let node = self.node()?;
        if !node.is_primary() {
            return Err(LbError::RunWalGarbageCollectionOnReplica);
        }

        let peers: Vec<NodeAddress> = node
            .members(NodeType::Query)
            .await?
            .into_iter()
            .filter(|peer| peer != node.address())
            .collect();

        let mut floor = self.oldest_in_use().await;
        for peer in &peers {
            let reply = node
                .send(
                    peer,
                    NodeMessage::WalVersionUsageRequest {
                        database: self.key.clone(),
                    },
                )
                .await
                .map_err(|e| {
                    warn!("wal: {} usage request to {} failed: {}", self.key, peer, e);
                    e
                })?;
            match reply {
                NodeMessage::WalVersionUsageResponse { oldest_in_use, .. } => {
                    floor = match (floor, oldest_in_use) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                _ => return Err(LbError::UnknownMessage),
            }
        }

        let (cutoff, removed) = {
            let mut state = self.state.lock().await;
            let cutoff = match (floor, state.latest()) {
                (Some(floor), _) => floor,
                (None, Some(latest)) => latest,
                (None, None) => return Ok(Vec::new()),
            };
            (cutoff, self.remove_unread_before(&mut state, cutoff).await?)
        };

        for peer in peers {
            let msg = NodeMessage::WalCollect {
                database: self.key.clone(),
                before: cutoff,
            };
            if let Err(e) = node.send(&peer, msg).await {
                warn!("wal: {} collect on {} failed: {}", self.key, peer, e);
            }
        }
        Ok(removed)
    }

    /// Drop unread versions older than `before` at the primary's request.
    pub async fn collect_below(&self, before: i64) -> LbResult<Vec<i64>> {
        let mut state = self.state.lock().await;
        self.remove_unread_before(&mut state, before).await
    }

    async fn remove_unread_before(&self, state: &mut WalState, before: i64) -> LbResult<Vec<i64>> {
        let doomed: Vec<i64> = state
            .versions
            .range(..before)
            .map(|(ts, _)| *ts)
            .filter(|ts| state.usage.get(ts).copied().unwrap_or(0) == 0)
            .collect();
        if doomed.is_empty() {
            return Ok(doomed);
        }

        for ts in &doomed {
            if let Some(wal) = state.versions.remove(ts) {
                wal.remove().await?;
            }
        }
        self.persist_index(state).await?;
        info!(
            "wal: {} collected {} versions below {}",
            self.key,
            doomed.len(),
            before
        );
        Ok(doomed)
    }

    /// Run `checkpoint` against `wal`, one checkpoint at a time, and mark the
    /// version immutable when it succeeds.
    pub async fn checkpoint<F, Fut>(&self, wal: &DatabaseWal, checkpoint: F) -> LbResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LbResult<()>>,
    {
        let _guard = self.checkpoint_lock.lock().await;
        if wal.is_checkpointed() {
            return Err(LbError::AlreadyCheckpointed);
        }
        let last = self.state.lock().await.last_checkpointed;
        if let Some(last) = last {
            if wal.timestamp() < last {
                return Err(LbError::CheckpointTooOld);
            }
        }

        checkpoint().await?;

        wal.mark_checkpointed(now_millis() as i64);
        let mut state = self.state.lock().await;
        let advanced = match state.last_checkpointed {
            Some(last) => last.max(wal.timestamp()),
            None => wal.timestamp(),
        };
        state.last_checkpointed = Some(advanced);
        debug!("wal: {} checkpointed version {}", self.key, wal.timestamp());
        Ok(())
    }

    pub async fn last_checkpointed(&self) -> Option<i64> {
        self.state.lock().await.last_checkpointed
    }

    /// Apply a write to version `timestamp` exactly.
    pub async fn apply_write(&self, timestamp: i64, offset: u64, data: &[u8]) -> LbResult<()> {
        self.version(timestamp).await?.write_at(offset, data).await
    }

    /// Apply a truncation to version `timestamp` exactly.
    pub async fn apply_truncate(&self, timestamp: i64, size: u64) -> LbResult<()> {
        self.version(timestamp).await?.truncate(size).await
    }
}
