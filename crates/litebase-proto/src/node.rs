/// Node identity and membership types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LbError;

/// Network address of a litebase node, always `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used for this node's presence marker (`:` becomes `_`).
    pub fn to_file_name(&self) -> String {
        self.0.replace(':', "_")
    }

    /// Inverse of [`NodeAddress::to_file_name`]; the port follows the last `_`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (host, port) = name.rsplit_once('_')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl FromStr for NodeAddress {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s.rsplit_once(':').ok_or(LbError::InvalidParms)?;
        if host.is_empty() {
            return Err(LbError::InvalidParms);
        }
        let port: u16 = port.parse().map_err(|_| LbError::InvalidParms)?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of work a node performs; leadership is elected per node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Executes client queries and owns WAL versions.
    Query,
    /// Holds durable copies of writes in replication groups.
    Storage,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Query => "query",
            NodeType::Storage => "storage",
        }
    }
}

impl FromStr for NodeType {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(NodeType::Query),
            "storage" => Ok(NodeType::Storage),
            _ => Err(LbError::InvalidConfig),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership state of a node within its node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeMembership {
    Primary,
    Replica,
    StandBy,
}

impl fmt::Display for NodeMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMembership::Primary => write!(f, "primary"),
            NodeMembership::Replica => write!(f, "replica"),
            NodeMembership::StandBy => write!(f, "standby"),
        }
    }
}
