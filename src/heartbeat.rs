//! # Heartbeat Manager
//!
//! One timer per node services every leader group. Each tick collects the
//! pending heartbeat from each group that is currently leading, coalesces
//! them into a single batched request per destination node, and routes the
//! per-group replies back to their consensus instances.

use crate::client::ClientCache;
use crate::consensus::Consensus;
use crate::protocol::{AppendEntriesRequest, HeartbeatRequest};
use crate::types::{GroupId, NodeId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Batches heartbeats for all locally-led groups
pub struct HeartbeatManager {
    interval: Duration,
    clients: Arc<ClientCache>,
    /// Weak registrations: a group mid-removal simply misses a tick.
    groups: Arc<DashMap<GroupId, Weak<Consensus>>>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HeartbeatManager {
    /// Create a manager ticking at `interval`
    pub fn new(interval: Duration, clients: Arc<ClientCache>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            interval,
            clients,
            groups: Arc::new(DashMap::new()),
            shutdown_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Register a group for heartbeat servicing (idempotent)
    pub fn register_group(&self, raft: &Arc<Consensus>) {
        self.groups.insert(raft.group(), Arc::downgrade(raft));
    }

    /// Remove a group from heartbeat servicing (idempotent)
    pub fn deregister_group(&self, group: GroupId) {
        self.groups.remove(&group);
    }

    /// Number of registered groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Spawn the tick loop
    pub fn start(&self) {
        let interval = self.interval;
        let clients = Arc::clone(&self.clients);
        let groups = Arc::clone(&self.groups);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_tick(&clients, &groups).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
    }

    /// Stop the tick loop and wait for the in-flight tick to finish
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("heartbeat manager stopped");
    }
}

/// One heartbeat round: gather, batch per destination, dispatch in
/// parallel, and hand replies back to their groups
async fn run_tick(clients: &ClientCache, groups: &DashMap<GroupId, Weak<Consensus>>) {
    let mut live: HashMap<GroupId, Arc<Consensus>> = HashMap::new();
    for entry in groups.iter() {
        if let Some(raft) = entry.value().upgrade() {
            live.insert(*entry.key(), raft);
        }
    }

    let mut per_node: HashMap<NodeId, Vec<AppendEntriesRequest>> = HashMap::new();
    for raft in live.values() {
        if let Some((peers, request)) = raft.heartbeat_round().await {
            for peer in peers {
                per_node.entry(peer).or_default().push(request.clone());
            }
        }
    }
    if per_node.is_empty() {
        return;
    }
    trace!(nodes = per_node.len(), "dispatching heartbeat batches");

    let dispatches = per_node.into_iter().map(|(node, heartbeats)| {
        let client = clients.get(&node);
        async move {
            let Some(client) = client else {
                debug!(node = %node, "no client for heartbeat destination");
                return Vec::new();
            };
            match client.heartbeat(HeartbeatRequest { heartbeats }).await {
                Ok(reply) => reply.replies,
                Err(e) => {
                    debug!(node = %node, error = %e, "heartbeat batch failed");
                    Vec::new()
                }
            }
        }
    });

    for reply in futures::future::join_all(dispatches).await.into_iter().flatten() {
        let Some(raft) = live.get(&reply.group) else {
            continue;
        };
        if let Err(e) = raft.process_heartbeat_reply(reply).await {
            warn!(group = %raft.group(), error = %e, "failed to process heartbeat reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RaftClient;
    use crate::config::RaftConfig;
    use crate::error::{Error, Result};
    use crate::protocol::{
        AppendEntriesReply, GroupConfiguration, HeartbeatReply, VoteReply, VoteRequest,
    };
    use crate::storage::memory::MemoryLog;
    use crate::storage::Log;
    use tokio::sync::mpsc;

    /// Records batched heartbeats and acks every inner request
    struct RecordingClient {
        batches: parking_lot::Mutex<Vec<HeartbeatRequest>>,
    }

    #[async_trait::async_trait]
    impl RaftClient for RecordingClient {
        async fn vote(&self, request: VoteRequest) -> Result<VoteReply> {
            Ok(VoteReply { group: request.group, term: request.term, granted: true })
        }

        async fn append_entries(
            &self,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesReply> {
            Err(Error::Rpc("not used in this test".into()))
        }

        async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply> {
            let replies = request
                .heartbeats
                .iter()
                .map(|hb| AppendEntriesReply {
                    group: hb.group,
                    term: hb.term,
                    success: true,
                    last_matched_offset: hb.prev_log_offset,
                })
                .collect();
            self.batches.lock().push(request);
            Ok(HeartbeatReply { replies })
        }
    }

    fn test_config() -> RaftConfig {
        RaftConfig {
            // Elections driven manually in tests.
            election_timeout_min: Duration::from_secs(60),
            election_timeout_max: Duration::from_secs(120),
            ..RaftConfig::default()
        }
    }

    #[tokio::test]
    async fn heartbeats_for_multiple_groups_batch_per_node() {
        let self_id = crate::types::NodeId::generate();
        let peer = crate::types::NodeId::generate();
        let clients = Arc::new(ClientCache::new());
        let recorder = Arc::new(RecordingClient { batches: parking_lot::Mutex::new(Vec::new()) });
        clients.insert(peer, Arc::clone(&recorder) as Arc<dyn RaftClient>);

        let dir = tempfile::tempdir().unwrap();
        let conf = GroupConfiguration { nodes: vec![self_id, peer] };
        let (tx, _rx) = mpsc::unbounded_channel();

        let groups: DashMap<GroupId, Weak<Consensus>> = DashMap::new();
        let mut rafts = Vec::new();
        for g in [1u64, 2] {
            let log = Arc::new(MemoryLog::new(dir.path().join(format!("g{g}"))));
            tokio::fs::create_dir_all(log.base_directory()).await.unwrap();
            let raft = Consensus::new(
                self_id,
                GroupId::new(g),
                conf.clone(),
                test_config(),
                log,
                Arc::clone(&clients),
                tx.clone(),
            );
            raft.start().await.unwrap();
            // Single peer grants, two-node majority reached.
            raft.dispatch_vote().await.unwrap();
            assert!(raft.is_leader().await);
            groups.insert(raft.group(), Arc::downgrade(&raft));
            rafts.push(raft);
        }

        run_tick(&clients, &groups).await;

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1, "both groups should share one batch");
        assert_eq!(batches[0].heartbeats.len(), 2);
        let mut seen: Vec<u64> =
            batches[0].heartbeats.iter().map(|hb| hb.group.value()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        for raft in &rafts {
            raft.stop().await;
        }
    }

    #[tokio::test]
    async fn higher_term_reply_demotes_leader_and_silences_heartbeats() {
        let self_id = crate::types::NodeId::generate();
        let peer = crate::types::NodeId::generate();
        let clients = Arc::new(ClientCache::new());
        let recorder = Arc::new(RecordingClient { batches: parking_lot::Mutex::new(Vec::new()) });
        clients.insert(peer, recorder as Arc<dyn RaftClient>);

        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let raft = Consensus::new(
            self_id,
            GroupId::new(1),
            GroupConfiguration { nodes: vec![self_id, peer] },
            test_config(),
            Arc::new(MemoryLog::new(dir.path().to_path_buf())),
            clients,
            tx,
        );
        raft.start().await.unwrap();
        raft.dispatch_vote().await.unwrap();
        assert!(raft.is_leader().await);
        assert!(raft.heartbeat_round().await.is_some());

        // A follower moved on to a later term; its reply deposes us.
        raft.process_heartbeat_reply(AppendEntriesReply {
            group: raft.group(),
            term: crate::types::Term::new(9),
            success: false,
            last_matched_offset: 0,
        })
        .await
        .unwrap();

        assert!(!raft.is_leader().await);
        assert_eq!(raft.meta().await.term, crate::types::Term::new(9));
        assert!(raft.heartbeat_round().await.is_none(), "deposed leader sends no heartbeats");
        raft.stop().await;
    }

    #[tokio::test]
    async fn dropped_group_misses_tick_without_error() {
        let clients = Arc::new(ClientCache::new());
        let groups: DashMap<GroupId, Weak<Consensus>> = DashMap::new();
        let self_id = crate::types::NodeId::generate();
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(MemoryLog::new(dir.path().to_path_buf()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let raft = Consensus::new(
            self_id,
            GroupId::new(7),
            GroupConfiguration { nodes: vec![self_id] },
            test_config(),
            log,
            Arc::clone(&clients),
            tx,
        );
        groups.insert(raft.group(), Arc::downgrade(&raft));
        drop(raft);

        // Upgrade fails, tick completes with nothing to send.
        run_tick(&clients, &groups).await;
        assert_eq!(groups.len(), 1);
    }
}
