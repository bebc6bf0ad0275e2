//! # litebase-proto
//!
//! Protocol types, constants, and data structures shared by litebase
//! cluster nodes.
//!
//! This crate defines the node-to-node wire messages, node identity and
//! membership types, query payloads, and the unified error type.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod message;
pub mod node;
pub mod query;

// Re-export commonly used types at the crate root
pub use error::{LbError, LbResult};
pub use message::NodeMessage;
pub use node::{NodeAddress, NodeMembership, NodeType};
pub use query::{DatabaseKey, QueryInput, QueryResponse};
