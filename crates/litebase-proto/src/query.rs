/// Query and database identifiers carried between nodes.
///
/// Statement execution itself lives outside the coordination core; these
/// types only describe what is forwarded to the primary and what comes back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one branch of one database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseKey {
    pub database_id: String,
    pub branch_id: String,
}

impl DatabaseKey {
    pub fn new(database_id: impl Into<String>, branch_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            branch_id: branch_id.into(),
        }
    }
}

impl fmt::Display for DatabaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database_id, self.branch_id)
    }
}

/// A bound parameter or result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A client query as received by any query node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInput {
    /// Client-supplied request id, echoed in the response.
    pub id: String,
    pub access_key_id: String,
    pub database_hash: String,
    pub database_id: String,
    pub branch_id: String,
    pub statement: String,
    pub parameters: Vec<ColumnValue>,
}

impl QueryInput {
    pub fn database_key(&self) -> DatabaseKey {
        DatabaseKey::new(self.database_id.clone(), self.branch_id.clone())
    }
}

/// Result of executing a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ColumnValue>>,
    pub changes: u64,
    pub last_insert_row_id: i64,
    pub latency_ms: f64,
}
