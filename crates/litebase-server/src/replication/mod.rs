//! Quorum replication across storage nodes.

pub mod group;
pub mod manager;

pub use group::{ReplicatedWrite, ReplicationGroup};
pub use manager::{compute_assignments, ReplicationConfig, ReplicationGroupManager};
