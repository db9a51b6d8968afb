//! # Core Types
//!
//! Fundamental identifiers used throughout the consensus core.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new unique node ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier for one replicated log/partition (a "raft group")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(u64);

impl GroupId {
    /// Create a group ID from a raw value
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw group ID value
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GroupId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Term number identifying an election epoch
///
/// Terms increase monotonically; a node's observed term never decreases, and
/// any message bearing a lower term is stale.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(u64);

impl Term {
    /// Create a new term with the given value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the term value
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The term that follows this one
    pub const fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset of an entry in a group's replicated log
///
/// Offsets start at 1; offset 0 is the position before the first entry.
pub type LogOffset = u64;
