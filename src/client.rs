//! # RPC Client Seam
//!
//! The consensus core dispatches vote and append-entries RPCs through a
//! per-peer client abstraction; connection management lives behind it. One
//! [`ClientCache`] is shared by every group on a shard and lives as long as
//! the group manager that owns it.

use crate::error::Result;
use crate::protocol::{
    AppendEntriesReply, AppendEntriesRequest, HeartbeatReply, HeartbeatRequest, VoteReply,
    VoteRequest,
};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Client for the raft RPCs of one remote peer
#[async_trait]
pub trait RaftClient: Send + Sync {
    /// Dispatch a vote request
    async fn vote(&self, request: VoteRequest) -> Result<VoteReply>;

    /// Dispatch an append-entries request
    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesReply>;

    /// Dispatch a batched heartbeat covering multiple groups
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply>;
}

/// Per-peer client lookup keyed by node identity
#[derive(Default)]
pub struct ClientCache {
    clients: DashMap<NodeId, Arc<dyn RaftClient>>,
}

impl ClientCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the client for a peer
    pub fn insert(&self, peer: NodeId, client: Arc<dyn RaftClient>) {
        self.clients.insert(peer, client);
    }

    /// Remove the client for a peer
    pub fn remove(&self, peer: &NodeId) {
        self.clients.remove(peer);
    }

    /// Look up the client for a peer
    pub fn get(&self, peer: &NodeId) -> Option<Arc<dyn RaftClient>> {
        self.clients.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of cached peer clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no peer clients are cached
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache").field("peers", &self.clients.len()).finish()
    }
}
