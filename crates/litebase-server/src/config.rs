//! Node configuration.
//!
//! [`Args`] is the command line; [`NodeConfig`] holds the resolved runtime
//! values. The cluster-wide [`ClusterConfig`] lives in the shared store so
//! every node can check that it is joining the cluster it expects.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use litebase_core::clock::now_millis;
use litebase_core::connection::ConnectionConfig;
use litebase_core::file_store::FileSystem;
use litebase_proto::constants::{CLUSTER_CONFIG_FILE, LB_LISTEN_PORT};
use litebase_proto::defaults::*;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::node::{NodeAddress, NodeType};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Which election strategy a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ElectionKind {
    /// Earliest entry in the shared nomination record wins.
    Nomination,
    /// Nomination followed by a majority vote of a small voter set.
    Confirmation,
}

/// Litebase cluster node
#[derive(Parser, Debug)]
#[command(name = "litebase", version, about = "Litebase cluster node")]
pub struct Args {
    /// Cluster identifier shared by every node
    #[arg(long, env = "LITEBASE_CLUSTER_ID")]
    pub cluster_id: Option<String>,

    /// Local data directory (WAL versions)
    #[arg(long, env = "LITEBASE_DATA_PATH", default_value = "./data")]
    pub data_path: PathBuf,

    /// Shared file store directory visible to every node
    #[arg(long, env = "LITEBASE_SHARED_PATH", default_value = "./shared")]
    pub shared_path: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Host other nodes use to reach this node
    #[arg(long, env = "LITEBASE_ADVERTISE_HOST", default_value = "127.0.0.1")]
    pub advertise_host: String,

    /// Listen port
    #[arg(short = 'p', long, env = "LITEBASE_PORT", default_value_t = LB_LISTEN_PORT)]
    pub port: u16,

    /// Node type (query, storage)
    #[arg(long, env = "LITEBASE_NODE_TYPE", default_value = "query")]
    pub node_type: NodeType,

    /// Cluster signature used to sign node headers
    #[arg(long, env = "LITEBASE_SIGNATURE", default_value = "")]
    pub signature: String,

    /// Election strategy
    #[arg(long, value_enum, default_value_t = ElectionKind::Nomination)]
    pub election: ElectionKind,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

/// Resolved runtime configuration of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub cluster_id: String,
    pub data_path: PathBuf,
    pub shared_path: PathBuf,
    pub bind_addr: String,
    pub advertise_host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub node_type: NodeType,
    pub signature: String,
    pub election: ElectionKind,

    pub lease_duration: Duration,
    pub lease_renewal_margin: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_validity: Duration,
    pub election_backoff: Duration,
    pub election_max_attempts: u32,
    pub election_timeout: Duration,
    pub nomination_ttl: Duration,
    pub connection: ConnectionConfig,
    pub membership_cache: Duration,
    pub quorum_ttl: Duration,
    pub quorum_wait: Duration,
    pub replicated_write_deadline: Duration,
    pub write_queue_capacity: usize,
    pub write_queue_idle: Duration,
    pub wal_gc_interval: Duration,
}

impl NodeConfig {
    /// Configuration with default timings.
    pub fn new(
        cluster_id: impl Into<String>,
        node_type: NodeType,
        shared_path: impl Into<PathBuf>,
        data_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            data_path: data_path.into(),
            shared_path: shared_path.into(),
            bind_addr: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            port: LB_LISTEN_PORT,
            node_type,
            signature: String::new(),
            election: ElectionKind::Nomination,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            lease_renewal_margin: Duration::from_secs(DEFAULT_LEASE_RENEWAL_MARGIN_SECS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_validity: Duration::from_millis(DEFAULT_HEARTBEAT_VALIDITY_MS),
            election_backoff: Duration::from_millis(DEFAULT_ELECTION_BACKOFF_MS),
            election_max_attempts: DEFAULT_ELECTION_MAX_ATTEMPTS,
            election_timeout: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MS),
            nomination_ttl: Duration::from_millis(DEFAULT_NOMINATION_TTL_MS),
            connection: ConnectionConfig::default(),
            membership_cache: Duration::from_secs(DEFAULT_MEMBERSHIP_CACHE_SECS),
            quorum_ttl: Duration::from_secs(DEFAULT_QUORUM_TTL_SECS),
            quorum_wait: Duration::from_millis(DEFAULT_QUORUM_WAIT_MS),
            replicated_write_deadline: Duration::from_secs(DEFAULT_REPLICATED_WRITE_DEADLINE_SECS),
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            write_queue_idle: Duration::from_millis(DEFAULT_WRITE_QUEUE_IDLE_MS),
            wal_gc_interval: Duration::from_secs(DEFAULT_WAL_GC_INTERVAL_SECS),
        }
    }

    /// Resolve command line arguments. A missing cluster id is fatal.
    pub fn from_args(args: &Args) -> LbResult<Self> {
        let cluster_id = match args.cluster_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(LbError::MissingClusterId),
        };

        let mut config = Self::new(
            cluster_id,
            args.node_type,
            args.shared_path.clone(),
            args.data_path.clone(),
        );
        config.bind_addr = args.bind_addr.clone();
        config.advertise_host = args.advertise_host.clone();
        config.port = args.port;
        config.signature = args.signature.clone();
        config.election = args.election;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn advertised_address(&self, port: u16) -> NodeAddress {
        NodeAddress::new(&self.advertise_host, port)
    }
}

/// Cluster-wide settings stored at `_cluster/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
    /// Unix ms.
    pub created_at: u64,
}

/// Load the cluster config from the shared store.
pub async fn load_cluster_config(store: &dyn FileSystem) -> LbResult<ClusterConfig> {
    let data = store.read_file(CLUSTER_CONFIG_FILE).await?;
    serde_json::from_slice(&data).map_err(|e| {
        error!("corrupt cluster config {}: {}", CLUSTER_CONFIG_FILE, e);
        LbError::InvalidConfig
    })
}

/// Save the cluster config to the shared store.
pub async fn save_cluster_config(store: &dyn FileSystem, config: &ClusterConfig) -> LbResult<()> {
    let data = serde_json::to_vec_pretty(config).map_err(|_| LbError::Codec)?;
    store.write_file(CLUSTER_CONFIG_FILE, &data).await?;
    debug!("saved cluster config: id={}", config.cluster_id);
    Ok(())
}

/// Load the cluster config, creating it on first start.
///
/// Fails with `InvalidConfig` when the store belongs to another cluster.
pub async fn ensure_cluster_config(
    store: &dyn FileSystem,
    cluster_id: &str,
) -> LbResult<ClusterConfig> {
    match load_cluster_config(store).await {
        Ok(existing) if existing.cluster_id == cluster_id => Ok(existing),
        Ok(existing) => {
            error!(
                "shared store belongs to cluster {}, not {}",
                existing.cluster_id, cluster_id
            );
            Err(LbError::InvalidConfig)
        }
        Err(LbError::NotFound) => {
            let config = ClusterConfig {
                cluster_id: cluster_id.to_string(),
                created_at: now_millis(),
            };
            save_cluster_config(store, &config).await?;
            info!("created cluster config for {}", cluster_id);
            Ok(config)
        }
        Err(e) => Err(e),
    }
}
