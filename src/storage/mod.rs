//! # Durable Log Seam
//!
//! The consensus core treats the on-disk log as an external collaborator and
//! talks to it through the [`Log`] trait: the log is the single source of
//! truth for on-disk position, and the consensus instance only coordinates
//! when and what to append. A [`memory::MemoryLog`] reference backend ships
//! for tests and bootstrap.

pub mod memory;

use crate::error::Result;
use crate::protocol::Entry;
use crate::types::{LogOffset, Term};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durability mode for an append operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Flush to stable storage before acknowledging
    Fsync,
    /// Acknowledge once buffered; flushing is the engine's concern
    Buffered,
}

/// Options handed to the log on every append
#[derive(Debug, Clone, Copy)]
pub struct AppendOptions {
    /// Requested durability mode
    pub durability: Durability,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self { durability: Durability::Fsync }
    }
}

/// Durable log collaborator for one raft group
///
/// Exclusive to its owning consensus instance; no two instances ever address
/// the same log.
#[async_trait]
pub trait Log: Send + Sync + 'static {
    /// Append entries at the tail, returning the offset assigned to each
    async fn append(&self, entries: Vec<Entry>, options: AppendOptions) -> Result<Vec<LogOffset>>;

    /// Remove every entry at offset `from` and beyond
    async fn truncate(&self, from: LogOffset) -> Result<()>;

    /// Term of the entry stored at `offset`, if present
    async fn term_at(&self, offset: LogOffset) -> Result<Option<Term>>;

    /// Highest offset durably recorded in the log (0 when empty)
    fn committed_offset(&self) -> LogOffset;

    /// Base directory of the log; group-scoped state (the voted-for record)
    /// is persisted under it
    fn base_directory(&self) -> &Path;
}
