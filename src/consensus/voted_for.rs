//! Persisted voted-for record.
//!
//! One record per group, stored beside the group's log. It is read once at
//! recovery and rewritten synchronously before any vote grant is
//! acknowledged, so a crash between decision and disk write can never be
//! observed as a granted vote.

use crate::error::{Error, Result};
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// File name of the record under the group's log base directory
pub const VOTED_FOR_FILE: &str = "voted_for";

/// The vote this node cast in `term`, if any
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotedFor {
    /// Node voted for in `term`
    pub voted_for: Option<NodeId>,
    /// Term the vote belongs to
    pub term: Term,
}

/// Path of the record for a log rooted at `base_dir`
pub fn record_path(base_dir: &Path) -> PathBuf {
    base_dir.join(VOTED_FOR_FILE)
}

/// Read the record back at recovery
///
/// A missing file is a first boot and yields the default record; an
/// unreadable file is fatal for the group, since defaulting could allow a
/// second vote within the recorded term.
pub async fn recover(base_dir: &Path) -> Result<VotedFor> {
    let path = record_path(base_dir);
    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| Error::VoteStateCorrupted { path, reason: e.to_string() }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(VotedFor::default()),
        Err(e) => Err(e.into()),
    }
}

/// Overwrite the record and flush it to stable storage
pub async fn persist(base_dir: &Path, record: &VotedFor) -> Result<()> {
    let path = record_path(base_dir);
    let raw = serde_json::to_vec(record).map_err(|e| Error::Storage(e.to_string()))?;
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(&raw).await?;
    file.sync_all().await?;
    Ok(())
}
