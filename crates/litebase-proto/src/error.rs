/// Litebase error types.
///
/// Every failure in the coordination core is one of these variants. The enum
/// is `Copy` and serialisable so a handler can return it to the sender inside
/// an `Error` message without losing its identity.

use serde::{Deserialize, Serialize};

/// Unified error type for all litebase node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum LbError {
    #[error("unknown error")]
    Unknown,
    #[error("I/O error")]
    Eio,
    #[error("file not found")]
    NotFound,
    #[error("failed to encode or decode message")]
    Codec,
    #[error("invalid parameters")]
    InvalidParms,

    // Transport
    #[error("network error between nodes")]
    NetworkError,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("node header rejected")]
    Unauthorized,
    #[error("unknown message kind")]
    UnknownMessage,
    #[error("operation cancelled")]
    Cancelled,

    // Leadership
    #[error("node is not the primary")]
    NotPrimary,
    #[error("no primary available")]
    NoPrimaryAvailable,
    #[error("lease expired")]
    LeaseExpired,
    #[error("lease verification failed")]
    LeaseVerificationFailed,
    #[error("election lost")]
    ElectionLost,

    // Replication groups
    #[error("timed out waiting for replication group quorum")]
    QuorumTimeout,
    #[error("replication group not found")]
    ReplicationGroupNotFound,
    #[error("replicated write already exists")]
    ReplicatedWriteExists,
    #[error("replicated write not found")]
    ReplicatedWriteNotFound,
    #[error("replicated write proposer mismatch")]
    ProposerMismatch,
    #[error("replicated write sha256 mismatch")]
    Sha256Mismatch,
    #[error("replicated write already prepared")]
    AlreadyPrepared,
    #[error("replicated write not prepared")]
    NotPrepared,

    // WAL
    #[error("cannot create a WAL version on a replica")]
    CreateWalVersionOnReplica,
    #[error("cannot run WAL garbage collection on a replica")]
    RunWalGarbageCollectionOnReplica,
    #[error("WAL version not found")]
    WalVersionNotFound,
    #[error("WAL version is older than the last checkpoint")]
    CheckpointTooOld,
    #[error("WAL version already checkpointed")]
    AlreadyCheckpointed,

    // Queries
    #[error("write queue is full")]
    WriteQueueFull,
    #[error("query failed")]
    QueryFailed,

    // Startup
    #[error("cluster id is not configured")]
    MissingClusterId,
    #[error("invalid configuration")]
    InvalidConfig,
}

impl LbError {
    /// Whether a caller may retry the operation after a short backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NoPrimaryAvailable
                | Self::QuorumTimeout
                | Self::ConnectionTimeout
                | Self::ConnectionClosed
                | Self::NetworkError
                | Self::WriteQueueFull
        )
    }

    /// Transport-level errors close the connection and force a new handshake.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::ConnectionClosed | Self::ConnectionTimeout | Self::Codec
        )
    }
}

/// Result type alias for litebase operations.
pub type LbResult<T> = Result<T, LbError>;

impl From<std::io::Error> for LbError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => LbError::NotFound,
            _ => LbError::Eio,
        }
    }
}
