/// Litebase protocol and shared-store layout constants.

/// Internal node-to-node protocol version
pub const LB_NODE_PROTO_VER: u8 = 0x01;

/// Default listen port for node-to-node connections
pub const LB_LISTEN_PORT: u16 = 8080;

/// Maximum size of a single wire frame (8 MB)
pub const LB_MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Number of members in every replication group
pub const REPLICATION_GROUP_SIZE: usize = 3;

/// Maximum number of voters asked to confirm an election
pub const ELECTION_MAX_VOTERS: usize = 5;

/// Header carrying the signed sender address
pub const NODE_HEADER: &str = "X-Lbdb-Node";

/// Header carrying the sender timestamp
pub const NODE_TIMESTAMP_HEADER: &str = "X-Lbdb-Node-Timestamp";

/// Maximum accepted clock skew on a node header (seconds)
pub const NODE_HEADER_MAX_SKEW_SECS: u64 = 30;

// Shared file store layout

/// Directory holding per node-type coordination files
pub const CLUSTER_DIR: &str = "_cluster";
/// Directory holding per node-type presence markers
pub const NODES_DIR: &str = "_nodes";
/// Lease file name (plain-text expiry in unix milliseconds)
pub const LEASE_FILE: &str = "LEASE";
/// Nomination record file name
pub const NOMINATION_FILE: &str = "NOMINATION";
/// Primary pointer file name
pub const PRIMARY_FILE: &str = "PRIMARY";
/// Cluster-wide configuration file
pub const CLUSTER_CONFIG_FILE: &str = "_cluster/config.json";

// WAL layout

/// Directory name for WAL versions inside a branch directory
pub const WAL_DIR: &str = "wal";
/// Persisted list of known WAL versions
pub const WAL_INDEX_FILE: &str = "INDEX";

// Cluster event keys

pub const EVENT_CLUSTER_JOIN: &str = "cluster:join";
pub const EVENT_CLUSTER_LEAVE: &str = "cluster:leave";
pub const EVENT_ACTIVATE_SIGNATURE: &str = "activate_signature";
pub const EVENT_NEXT_SIGNATURE: &str = "next_signature";
