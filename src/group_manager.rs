//! # Group Manager
//!
//! Node-level owner of every local consensus instance. Wires each group into
//! the shared heartbeat manager, fans leadership changes out to observers,
//! and drives orderly shutdown: stop admissions first, silence heartbeats,
//! then stop every group in parallel.

use crate::client::ClientCache;
use crate::config::RaftConfig;
use crate::consensus::Consensus;
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::heartbeat::HeartbeatManager;
use crate::hook::ProtocolHook;
use crate::protocol::{GroupConfiguration, LeadershipStatus};
use crate::storage::Log;
use crate::types::{GroupId, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Manages all raft groups hosted on this node
pub struct GroupManager {
    self_id: NodeId,
    config: RaftConfig,
    clients: Arc<ClientCache>,
    heartbeats: HeartbeatManager,
    groups: DashMap<GroupId, Arc<Consensus>>,
    gate: Gate,
    leadership_tx: mpsc::UnboundedSender<LeadershipStatus>,
    observers: Arc<parking_lot::RwLock<Vec<mpsc::UnboundedSender<LeadershipStatus>>>>,
    dispatch: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GroupManager {
    /// Create a manager for this node
    pub fn new(self_id: NodeId, config: RaftConfig, clients: Arc<ClientCache>) -> Result<Self> {
        config.validate()?;
        let heartbeats = HeartbeatManager::new(config.heartbeat_interval, Arc::clone(&clients));
        let (leadership_tx, leadership_rx) = mpsc::unbounded_channel();
        let observers: Arc<parking_lot::RwLock<Vec<mpsc::UnboundedSender<LeadershipStatus>>>> =
            Arc::new(parking_lot::RwLock::new(Vec::new()));
        let dispatch = tokio::spawn(dispatch_leadership(leadership_rx, Arc::clone(&observers)));
        Ok(Self {
            self_id,
            config,
            clients,
            heartbeats,
            groups: DashMap::new(),
            gate: Gate::new(),
            leadership_tx,
            observers,
            dispatch: parking_lot::Mutex::new(Some(dispatch)),
        })
    }

    /// This node's identity
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Start node-wide services (the heartbeat timer)
    pub fn start(&self) {
        self.heartbeats.start();
        info!(node = %self.self_id, "group manager started");
    }

    /// Subscribe to leadership change notifications for every local group
    ///
    /// Notifications are delivered asynchronously; a receiver that is
    /// dropped is pruned on the next delivery.
    pub fn subscribe_leadership(&self) -> mpsc::UnboundedReceiver<LeadershipStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.write().push(tx);
        rx
    }

    /// Create, recover, and start a consensus instance for `group`
    ///
    /// The optional hook observes replicated entries through their
    /// pre-commit/abort/commit transitions. Fails with
    /// [`Error::GroupAlreadyActive`] when the group is already hosted here.
    pub async fn start_group(
        &self,
        group: GroupId,
        nodes: Vec<NodeId>,
        log: Arc<dyn Log>,
        hook: Option<Arc<dyn ProtocolHook>>,
    ) -> Result<Arc<Consensus>> {
        let _gate = self.gate.enter()?;
        let raft = Consensus::new(
            self.self_id,
            group,
            GroupConfiguration { nodes },
            self.config.clone(),
            log,
            Arc::clone(&self.clients),
            self.leadership_tx.clone(),
        );
        if let Some(hook) = hook {
            raft.register_hook(hook);
        }

        match self.groups.entry(group) {
            Entry::Occupied(_) => return Err(Error::GroupAlreadyActive(group)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&raft));
            }
        }

        if let Err(e) = raft.start().await {
            warn!(group = %group, error = %e, "failed to start group");
            self.groups.remove(&group);
            return Err(e);
        }
        self.heartbeats.register_group(&raft);
        info!(group = %group, "group started");
        Ok(raft)
    }

    /// Look up a locally hosted group
    pub fn group(&self, group: GroupId) -> Option<Arc<Consensus>> {
        self.groups.get(&group).map(|g| Arc::clone(g.value()))
    }

    /// Number of locally hosted groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Stop and remove one group
    pub async fn stop_group(&self, group: GroupId) -> Result<()> {
        let _gate = self.gate.enter()?;
        let raft = self.group(group).ok_or(Error::GroupNotFound(group))?;
        // Quiesce the instance before its heartbeats disappear, then drop
        // the registration.
        raft.stop().await;
        self.heartbeats.deregister_group(group);
        self.groups.remove(&group);
        info!(group = %group, "group stopped");
        Ok(())
    }

    /// Stop the node: refuse new group operations, silence heartbeats,
    /// then stop every group in parallel
    pub async fn stop(&self) {
        debug!(node = %self.self_id, "stopping group manager");
        self.gate.close().await;
        self.heartbeats.stop().await;

        let rafts: Vec<Arc<Consensus>> =
            self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        futures::future::join_all(rafts.iter().map(|raft| raft.stop())).await;
        self.groups.clear();

        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
        info!(node = %self.self_id, "group manager stopped");
    }
}

/// Re-broadcast leadership events to every live observer, pruning closed
/// receivers as they are discovered
async fn dispatch_leadership(
    mut rx: mpsc::UnboundedReceiver<LeadershipStatus>,
    observers: Arc<parking_lot::RwLock<Vec<mpsc::UnboundedSender<LeadershipStatus>>>>,
) {
    while let Some(status) = rx.recv().await {
        observers.write().retain(|observer| observer.send(status).is_ok());
    }
}
