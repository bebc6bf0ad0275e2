//! # litebase-server
//!
//! The litebase node: membership, primary election over a shared lease,
//! quorum replication groups for storage nodes, versioned WAL management
//! for query nodes and query routing between them.

pub mod cluster;
pub mod config;
pub mod context;
pub mod election;
pub mod events;
pub mod lease;
pub mod membership;
pub mod node;
pub mod query;
pub mod replication;
pub mod roles;
pub mod wal;
pub mod write_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::start_node;
pub use node::Node;
