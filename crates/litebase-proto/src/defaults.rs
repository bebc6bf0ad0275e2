//! Tunable operational defaults for litebase nodes.
//!
//! Protocol-level constants (frame sizes, file names) remain in
//! [`crate::constants`]. This module centralizes the timing and sizing
//! defaults that the node configuration can override.

// ─── Lease / Election ───────────────────────────────────────────────────────

/// How long a primary lease stays valid after a renewal (seconds).
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 70;

/// Renew the lease once its remaining validity drops below this (seconds).
pub const DEFAULT_LEASE_RENEWAL_MARGIN_SECS: u64 = 10;

/// Interval of the node heartbeat loop (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// A heartbeat received from the primary is trusted for this long (ms).
pub const DEFAULT_HEARTBEAT_VALIDITY_MS: u64 = 3_000;

/// Backoff before retrying a failed election attempt (milliseconds).
pub const DEFAULT_ELECTION_BACKOFF_MS: u64 = 1_000;

/// Maximum attempts for a single election round.
pub const DEFAULT_ELECTION_MAX_ATTEMPTS: u32 = 3;

/// Time allowed for election confirmation votes (milliseconds).
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 3_000;

/// Nomination entries older than this are ignored (milliseconds).
pub const DEFAULT_NOMINATION_TTL_MS: u64 = 5_000;

// ─── Connections ────────────────────────────────────────────────────────────

/// Timeout waiting for a response to a sent message (milliseconds).
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 3_000;

/// Idle connections are closed after this long (milliseconds).
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 5_000;

/// Timeout for establishing a TCP connection (milliseconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;

// ─── Membership ─────────────────────────────────────────────────────────────

/// Cluster membership cache lifetime (seconds).
pub const DEFAULT_MEMBERSHIP_CACHE_SECS: u64 = 60;

// ─── Replication groups ─────────────────────────────────────────────────────

/// Group membership is trusted without re-verification for this long (seconds).
pub const DEFAULT_QUORUM_TTL_SECS: u64 = 10;

/// Maximum time a non-primary waits for a fresh assignment (milliseconds).
pub const DEFAULT_QUORUM_WAIT_MS: u64 = 1_000;

/// Interval between assignment checks while waiting for quorum (milliseconds).
pub const DEFAULT_QUORUM_POLL_MS: u64 = 50;

/// Deadline attached to a replicated write (seconds).
pub const DEFAULT_REPLICATED_WRITE_DEADLINE_SECS: u64 = 30;

// ─── Write queue ────────────────────────────────────────────────────────────

/// Pending jobs allowed in one database write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1_000;

/// A write queue worker stops after being idle this long (milliseconds).
pub const DEFAULT_WRITE_QUEUE_IDLE_MS: u64 = 3_000;

// ─── WAL ────────────────────────────────────────────────────────────────────

/// Interval between WAL garbage collection passes on the query primary (seconds).
pub const DEFAULT_WAL_GC_INTERVAL_SECS: u64 = 60;
