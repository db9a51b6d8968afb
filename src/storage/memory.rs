//! In-memory reference backend for the [`Log`] trait.
//!
//! Entries live in a plain vector; durability modes are accepted and ignored.
//! Useful for tests and single-process bootstrap; the disk engine proper is
//! a separate component.

use super::{AppendOptions, Log};
use crate::error::Result;
use crate::protocol::Entry;
use crate::types::{LogOffset, Term};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

/// Volatile, offset-assigning log
#[derive(Debug)]
pub struct MemoryLog {
    base_dir: PathBuf,
    // offsets start at 1: the entry at index i holds offset i + 1
    entries: RwLock<Vec<Entry>>,
}

impl MemoryLog {
    /// Create an empty log rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), entries: RwLock::new(Vec::new()) }
    }

    /// Snapshot of the stored entries, in offset order
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.read().clone()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Log for MemoryLog {
    async fn append(
        &self,
        entries: Vec<Entry>,
        _options: AppendOptions,
    ) -> Result<Vec<LogOffset>> {
        let mut stored = self.entries.write();
        let mut offsets = Vec::with_capacity(entries.len());
        for mut entry in entries {
            let offset = stored.len() as LogOffset + 1;
            entry.offset = offset;
            stored.push(entry);
            offsets.push(offset);
        }
        Ok(offsets)
    }

    async fn truncate(&self, from: LogOffset) -> Result<()> {
        if from == 0 {
            self.entries.write().clear();
            return Ok(());
        }
        self.entries.write().truncate(from as usize - 1);
        Ok(())
    }

    async fn term_at(&self, offset: LogOffset) -> Result<Option<Term>> {
        if offset == 0 {
            return Ok(None);
        }
        Ok(self.entries.read().get(offset as usize - 1).map(|e| e.term))
    }

    fn committed_offset(&self) -> LogOffset {
        self.entries.read().last().map(|e| e.offset).unwrap_or(0)
    }

    fn base_directory(&self) -> &Path {
        &self.base_dir
    }
}
