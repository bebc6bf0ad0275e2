//! Cluster membership set.
//!
//! Each live node owns a presence marker `_nodes/<type>/<host_port>` in the
//! shared store holding its join time. Listings are cached and refreshed
//! after the cache lifetime or on a `cluster:join` / `cluster:leave` event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use litebase_core::clock::now_millis;
use litebase_core::file_store::FileSystem;
use litebase_proto::constants::NODES_DIR;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::node::{NodeAddress, NodeType};
use tracing::{debug, info, warn};

struct CachedMembers {
    loaded_at: Instant,
    members: Vec<NodeAddress>,
}

pub struct Membership {
    store: Arc<dyn FileSystem>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<NodeType, CachedMembers>>,
}

fn marker_dir(node_type: NodeType) -> String {
    format!("{}/{}", NODES_DIR, node_type.as_str())
}

fn marker_path(node_type: NodeType, address: &NodeAddress) -> String {
    format!("{}/{}", marker_dir(node_type), address.to_file_name())
}

impl Membership {
    pub fn new(store: Arc<dyn FileSystem>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Write this node's presence marker.
    pub async fn join(&self, node_type: NodeType, address: &NodeAddress) -> LbResult<()> {
        let path = marker_path(node_type, address);
        self.store
            .write_file(&path, now_millis().to_string().as_bytes())
            .await?;
        self.invalidate();
        info!("membership: {} joined as {}", address, node_type);
        Ok(())
    }

    /// Remove this node's presence marker.
    pub async fn leave(&self, node_type: NodeType, address: &NodeAddress) -> LbResult<()> {
        match self.store.remove(&marker_path(node_type, address)).await {
            Ok(()) | Err(LbError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.invalidate();
        info!("membership: {} left", address);
        Ok(())
    }

    /// Members of one node type in arrival order (join time, then address).
    pub async fn members(&self, node_type: NodeType) -> LbResult<Vec<NodeAddress>> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&node_type) {
                if cached.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(cached.members.clone());
                }
            }
        }

        let members = self.load(node_type).await?;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            node_type,
            CachedMembers {
                loaded_at: Instant::now(),
                members: members.clone(),
            },
        );
        Ok(members)
    }

    /// Members of every node type.
    pub async fn all_members(&self) -> LbResult<Vec<NodeAddress>> {
        let mut all = self.members(NodeType::Query).await?;
        for address in self.members(NodeType::Storage).await? {
            if !all.contains(&address) {
                all.push(address);
            }
        }
        Ok(all)
    }

    /// Drop cached listings so the next lookup re-reads the store.
    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("membership: cache invalidated");
    }

    async fn load(&self, node_type: NodeType) -> LbResult<Vec<NodeAddress>> {
        let dir = marker_dir(node_type);
        let names = match self.store.read_dir(&dir).await {
            Ok(names) => names,
            Err(LbError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Some(address) = NodeAddress::from_file_name(&name) else {
                warn!("membership: ignoring unexpected marker {}", name);
                continue;
            };
            let joined_at = match self.store.read_file(&format!("{}/{}", dir, name)).await {
                Ok(data) => String::from_utf8_lossy(&data).trim().parse::<u64>().unwrap_or(0),
                // Removed between listing and reading.
                Err(LbError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            entries.push((joined_at, address));
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, address)| address).collect())
    }
}
