//! # Error Handling
//!
//! Error types for consensus and group lifecycle operations.
//!
//! Protocol-level disagreements (stale terms, log mismatches) are not errors:
//! they are resolved through reply payloads and never surface here. Only
//! resource failures (disk, persisted state, lifecycle misuse) become
//! `Error` values.

use crate::types::{GroupId, NodeId};
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the consensus core
#[derive(Debug, Error)]
pub enum Error {
    /// New operations are refused while shutdown drains in-flight ones
    #[error("shutting down")]
    ShuttingDown,

    /// A group with this identity is already active on the shard
    #[error("group {0} is already active")]
    GroupAlreadyActive(GroupId),

    /// No active group with this identity
    #[error("group {0} is not active")]
    GroupNotFound(GroupId),

    /// The persisted voted-for record could not be decoded at recovery
    ///
    /// Fatal for the group: defaulting to an empty vote state could allow a
    /// double vote within the recorded term.
    #[error("voted-for record at {path} is corrupted: {reason}")]
    VoteStateCorrupted {
        /// Path of the unreadable record
        path: PathBuf,
        /// Decode failure detail
        reason: String,
    },

    /// I/O failure reading or writing persisted state
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the durable log collaborator
    #[error("storage error: {0}")]
    Storage(String),

    /// A disk operation exceeded its configured time budget
    #[error("disk operation timed out after {timeout_ms}ms")]
    DiskTimeout {
        /// The budget that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// RPC dispatch failure; elections treat this as "no reply"
    #[error("rpc error: {0}")]
    Rpc(String),

    /// No client connection is cached for the peer
    #[error("no client for peer {0}")]
    PeerUnavailable(NodeId),

    /// Invalid configuration supplied at construction
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, Error>;
