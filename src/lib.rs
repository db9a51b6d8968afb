//! # DriftStream Raft
//!
//! Per-group raft consensus for the DriftStream storage platform. A node
//! hosts many independent raft groups; each group replicates one durable
//! log, elects its own leader, and shares node-wide services (the heartbeat
//! timer and the RPC client cache) with every other group on the node.
//!
//! ## Architecture
//!
//! - [`GroupManager`] owns the local groups and node-wide services
//! - [`Consensus`] runs one group's vote and replication state machine
//! - [`HeartbeatManager`] batches per-peer heartbeats across leader groups
//! - [`storage::Log`] abstracts the durable per-group log
//! - [`client::RaftClient`] abstracts the transport to peer nodes
//!
//! ## Quick Start
//!
//! ```no_run
//! use driftstream_raft::prelude::*;
//! use driftstream_raft::storage::memory::MemoryLog;
//! use std::sync::Arc;
//!
//! # async fn run() -> driftstream_raft::Result<()> {
//! let self_id = NodeId::generate();
//! let clients = Arc::new(ClientCache::new());
//! let manager = GroupManager::new(self_id, RaftConfig::default(), clients)?;
//! manager.start();
//!
//! let log = Arc::new(MemoryLog::new("/tmp/driftstream/group-1"));
//! let raft = manager
//!     .start_group(GroupId::new(1), vec![self_id], log, None)
//!     .await?;
//! println!("leader: {}", raft.is_leader().await);
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod consensus;
pub mod error;
pub mod gate;
pub mod group_manager;
pub mod heartbeat;
pub mod hook;
pub mod jitter;
pub mod protocol;
pub mod storage;
pub mod types;

pub use client::{ClientCache, RaftClient};
pub use config::RaftConfig;
pub use consensus::{Consensus, VoteState};
pub use error::{Error, Result};
pub use group_manager::GroupManager;
pub use heartbeat::HeartbeatManager;
pub use hook::ProtocolHook;
pub use protocol::{
    AppendEntriesReply, AppendEntriesRequest, Entry, GroupConfiguration, HeartbeatReply,
    HeartbeatRequest, LeadershipStatus, ProtocolMetadata, VoteReply, VoteRequest,
};
pub use types::{GroupId, LogOffset, NodeId, Term};

/// Commonly used types for working with the crate
pub mod prelude {
    pub use crate::client::{ClientCache, RaftClient};
    pub use crate::config::RaftConfig;
    pub use crate::consensus::{Consensus, VoteState};
    pub use crate::error::{Error, Result};
    pub use crate::group_manager::GroupManager;
    pub use crate::hook::ProtocolHook;
    pub use crate::protocol::{Entry, GroupConfiguration, LeadershipStatus};
    pub use crate::storage::{AppendOptions, Durability, Log};
    pub use crate::types::{GroupId, LogOffset, NodeId, Term};
}
