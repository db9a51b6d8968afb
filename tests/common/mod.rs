//! Shared in-process cluster harness for integration tests.
//!
//! Wires consensus instances together through an in-memory transport so
//! multi-node scenarios run in one process with no sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use driftstream_raft::client::{ClientCache, RaftClient};
use driftstream_raft::config::RaftConfig;
use driftstream_raft::consensus::Consensus;
use driftstream_raft::error::{Error, Result};
use driftstream_raft::protocol::{
    AppendEntriesReply, AppendEntriesRequest, GroupConfiguration, HeartbeatReply,
    HeartbeatRequest, LeadershipStatus, VoteReply, VoteRequest,
};
use driftstream_raft::storage::memory::MemoryLog;
use driftstream_raft::types::{GroupId, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// In-process routing fabric connecting test nodes
#[derive(Clone, Default)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

#[derive(Default)]
struct MeshInner {
    nodes: parking_lot::RwLock<HashMap<NodeId, Arc<Consensus>>>,
    down: parking_lot::RwLock<HashSet<NodeId>>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable through the mesh
    pub fn register(&self, node: NodeId, raft: Arc<Consensus>) {
        self.inner.nodes.write().insert(node, raft);
    }

    pub fn deregister(&self, node: NodeId) {
        self.inner.nodes.write().remove(&node);
    }

    /// Sever or restore a node's connectivity
    pub fn set_down(&self, node: NodeId, down: bool) {
        if down {
            self.inner.down.write().insert(node);
        } else {
            self.inner.down.write().remove(&node);
        }
    }

    /// A client that routes RPCs for `target` through this mesh
    pub fn client(&self, target: NodeId) -> Arc<dyn RaftClient> {
        Arc::new(MeshClient { target, inner: Arc::clone(&self.inner) })
    }
}

struct MeshClient {
    target: NodeId,
    inner: Arc<MeshInner>,
}

impl MeshClient {
    fn lookup(&self) -> Result<Arc<Consensus>> {
        if self.inner.down.read().contains(&self.target) {
            return Err(Error::PeerUnavailable(self.target));
        }
        self.inner
            .nodes
            .read()
            .get(&self.target)
            .cloned()
            .ok_or(Error::PeerUnavailable(self.target))
    }
}

#[async_trait]
impl RaftClient for MeshClient {
    async fn vote(&self, request: VoteRequest) -> Result<VoteReply> {
        let raft = self.lookup()?;
        raft.vote(request).await
    }

    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        let raft = self.lookup()?;
        raft.append_entries(request).await
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply> {
        let raft = self.lookup()?;
        let mut replies = Vec::with_capacity(request.heartbeats.len());
        for heartbeat in request.heartbeats {
            if let Ok(reply) = raft.append_entries(heartbeat).await {
                replies.push(reply);
            }
        }
        Ok(HeartbeatReply { replies })
    }
}

/// A cluster of directly-constructed consensus instances sharing one group
pub struct TestCluster {
    pub mesh: Mesh,
    pub nodes: Vec<Arc<Consensus>>,
    pub ids: Vec<NodeId>,
    pub logs: Vec<Arc<MemoryLog>>,
    pub leadership_rx: mpsc::UnboundedReceiver<LeadershipStatus>,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    pub fn node(&self, idx: usize) -> &Arc<Consensus> {
        &self.nodes[idx]
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

/// Config with elections parked far in the future so tests drive
/// `dispatch_vote` deterministically
pub fn manual_election_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_secs(300),
        election_timeout_max: Duration::from_secs(600),
        ..RaftConfig::default()
    }
}

/// Install the test log subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build and start an `n`-node cluster for group 1 with manual elections
pub async fn cluster(n: usize) -> TestCluster {
    cluster_with_config(n, manual_election_config()).await
}

pub async fn cluster_with_config(n: usize, config: RaftConfig) -> TestCluster {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mesh = Mesh::new();
    let ids: Vec<NodeId> = (0..n).map(|_| NodeId::generate()).collect();
    let conf = GroupConfiguration { nodes: ids.clone() };
    let (leadership_tx, leadership_rx) = mpsc::unbounded_channel();

    let clients = Arc::new(ClientCache::new());
    for id in &ids {
        clients.insert(*id, mesh.client(*id));
    }

    let mut nodes = Vec::with_capacity(n);
    let mut logs = Vec::with_capacity(n);
    for (i, id) in ids.iter().enumerate() {
        let base = dir.path().join(format!("node-{i}"));
        tokio::fs::create_dir_all(&base).await.unwrap();
        let log = Arc::new(MemoryLog::new(base));
        let raft = Consensus::new(
            *id,
            GroupId::new(1),
            conf.clone(),
            config.clone(),
            Arc::clone(&log) as _,
            Arc::clone(&clients),
            leadership_tx.clone(),
        );
        raft.start().await.unwrap();
        mesh.register(*id, Arc::clone(&raft));
        nodes.push(raft);
        logs.push(log);
    }

    TestCluster { mesh, nodes, ids, logs, leadership_rx, _dir: dir }
}

/// Wait until `predicate` holds or the deadline passes
pub async fn wait_for<F, Fut>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
