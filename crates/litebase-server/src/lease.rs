//! Primary lease over the shared file store.
//!
//! Two files under `_cluster/<type>/` back the lease: `PRIMARY` names the
//! holder and `LEASE` holds the expiry in unix milliseconds as plain text.
//! A lease is valid only while it has not expired and `PRIMARY` still names
//! the holder. Every write is read back before it is trusted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use litebase_core::file_store::FileSystem;
use litebase_proto::constants::{CLUSTER_DIR, LEASE_FILE, PRIMARY_FILE};
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::node::{NodeAddress, NodeType};
use tracing::{debug, info, warn};

/// Path of a coordination file for one node type.
pub fn cluster_file(node_type: NodeType, name: &str) -> String {
    format!("{}/{}/{}", CLUSTER_DIR, node_type.as_str(), name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseState {
    /// Unix ms; 0 when not held.
    pub expires_at: u64,
    pub renewed_at: u64,
}

pub struct Lease {
    store: Arc<dyn FileSystem>,
    address: NodeAddress,
    lease_path: String,
    primary_path: String,
    duration: Duration,
    margin: Duration,
    state: Mutex<LeaseState>,
}

impl Lease {
    pub fn new(
        store: Arc<dyn FileSystem>,
        address: NodeAddress,
        node_type: NodeType,
        duration: Duration,
        margin: Duration,
    ) -> Self {
        Self {
            store,
            address,
            lease_path: cluster_file(node_type, LEASE_FILE),
            primary_path: cluster_file(node_type, PRIMARY_FILE),
            duration,
            margin,
            state: Mutex::new(LeaseState::default()),
        }
    }

    pub fn state(&self) -> LeaseState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn expires_at(&self) -> u64 {
        self.state().expires_at
    }

    /// Whether the locally held lease is unexpired at `now` (unix ms).
    pub fn is_held(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    /// Whether the remaining validity has dropped below the renewal margin.
    pub fn needs_renewal(&self, now: u64) -> bool {
        self.expires_at().saturating_sub(now) < self.margin.as_millis() as u64
    }

    /// Forget the locally held lease without touching the store.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = LeaseState::default();
    }

    /// Address named by the primary pointer, if any.
    pub async fn read_primary(&self) -> LbResult<Option<NodeAddress>> {
        let data = match self.store.read_file(&self.primary_path).await {
            Ok(data) => data,
            Err(LbError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&data);
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        match text.parse() {
            Ok(address) => Ok(Some(address)),
            Err(_) => {
                warn!("lease: unreadable primary pointer {:?}", text);
                Ok(None)
            }
        }
    }

    /// Expiry recorded in the shared lease file, if any.
    pub async fn read_expiry(&self) -> LbResult<Option<u64>> {
        let data = match self.store.read_file(&self.lease_path).await {
            Ok(data) => data,
            Err(LbError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(String::from_utf8_lossy(&data).trim().parse().ok())
    }

    /// The primary holding an unexpired lease at `now`, with its expiry.
    pub async fn current_primary(&self, now: u64) -> LbResult<Option<(NodeAddress, u64)>> {
        let Some(primary) = self.read_primary().await? else {
            return Ok(None);
        };
        match self.read_expiry().await? {
            Some(expires_at) if expires_at > now => Ok(Some((primary, expires_at))),
            _ => Ok(None),
        }
    }

    /// Point the primary pointer at this node and verify the write.
    ///
    /// Refuses with `ElectionLost` while another node holds an unexpired
    /// lease at `now`, checked both before writing and on read-back.
    pub async fn claim_primary(&self, now: u64) -> LbResult<()> {
        self.ensure_unclaimed(now).await?;
        self.store
            .write_file(&self.primary_path, self.address.as_str().as_bytes())
            .await?;
        if self.read_primary().await? != Some(self.address.clone()) {
            warn!("lease: primary pointer read-back mismatch");
            return Err(LbError::LeaseVerificationFailed);
        }
        info!("lease: {} claimed primary pointer", self.address);
        Ok(())
    }

    async fn ensure_unclaimed(&self, now: u64) -> LbResult<()> {
        match self.current_primary(now).await? {
            Some((holder, expires_at)) if holder != self.address => {
                info!(
                    "lease: {} holds the primary lease until {}, not claiming",
                    holder, expires_at
                );
                Err(LbError::ElectionLost)
            }
            _ => Ok(()),
        }
    }

    /// Extend the lease. The new expiry is always later than the previous one.
    ///
    /// Fails with `LeaseVerificationFailed` when the primary pointer names
    /// another node or the written expiry does not read back identically.
    pub async fn renew(&self, now: u64) -> LbResult<u64> {
        if self.read_primary().await? != Some(self.address.clone()) {
            warn!("lease: primary pointer no longer names {}", self.address);
            return Err(LbError::LeaseVerificationFailed);
        }

        let previous = self.expires_at();
        let expires_at = (now + self.duration.as_millis() as u64).max(previous + 1);
        let encoded = expires_at.to_string();
        self.store
            .write_file(&self.lease_path, encoded.as_bytes())
            .await?;

        let stored = self.store.read_file(&self.lease_path).await?;
        if stored != encoded.as_bytes() {
            warn!("lease: read-back mismatch after renewal");
            return Err(LbError::LeaseVerificationFailed);
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = LeaseState {
            expires_at,
            renewed_at: now,
        };
        debug!("lease: renewed until {}", expires_at);
        Ok(expires_at)
    }

    /// Give up the lease, removing the shared files if this node holds them.
    pub async fn release(&self) -> LbResult<()> {
        self.reset();
        if self.read_primary().await? != Some(self.address.clone()) {
            return Ok(());
        }
        for path in [&self.lease_path, &self.primary_path] {
            match self.store.remove(path).await {
                Ok(()) | Err(LbError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        info!("lease: {} released", self.address);
        Ok(())
    }
}
