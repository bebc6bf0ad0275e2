//! # litebase-core
//!
//! Core shared library for litebase cluster nodes.
//! Provides the shared file store abstraction, framed async networking,
//! persistent node connections and their pool, node header signing, and
//! the retry policy used by the coordination layer.

pub mod clock;
pub mod codec;
pub mod connection;
pub mod connection_pool;
pub mod file_store;
pub mod listener;
pub mod net;
pub mod retry;
pub mod signature;
