//! # Per-Group Consensus
//!
//! One [`Consensus`] instance owns the term, vote, and log-replication state
//! of a single raft group. All mutating operations (vote handling,
//! append-entries handling, election dispatch) serialize through one
//! exclusive admission token and register under a drain-then-close shutdown
//! gate, so per-group state needs no finer-grained locking while thousands of
//! groups stay fully concurrent with each other.

pub mod voted_for;

use crate::client::ClientCache;
use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::hook::ProtocolHook;
use crate::jitter::TimeoutJitter;
use crate::protocol::{
    AppendEntriesReply, AppendEntriesRequest, Entry, GroupConfiguration, LeadershipStatus,
    ProtocolMetadata, VoteReply, VoteRequest,
};
use crate::storage::{AppendOptions, Log};
use crate::types::{GroupId, LogOffset, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use self::voted_for::VotedFor;

/// Vote state of a consensus instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteState {
    /// Following a leader (or waiting to hear from one)
    #[default]
    Follower,
    /// Campaigning for leadership
    Candidate,
    /// Leading the group for the current term
    Leader,
}

impl fmt::Display for VoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Candidate => write!(f, "candidate"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

/// Mutable per-group state, guarded by the admission token
#[derive(Debug)]
struct GroupState {
    vstate: VoteState,
    meta: ProtocolMetadata,
    conf: GroupConfiguration,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
}

/// Consensus for one raft group
pub struct Consensus {
    self_id: NodeId,
    group: GroupId,
    config: RaftConfig,
    jitter: TimeoutJitter,
    log: Arc<dyn Log>,
    clients: Arc<ClientCache>,
    leadership_tx: mpsc::UnboundedSender<LeadershipStatus>,
    /// The admission token: one mutating operation at a time per group.
    state: Mutex<GroupState>,
    gate: Gate,
    hooks: parking_lot::RwLock<Vec<Arc<dyn ProtocolHook>>>,
    timer_reset: Notify,
    shutdown_tx: watch::Sender<bool>,
    timer_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    weak_self: Weak<Consensus>,
}

impl Consensus {
    /// Create a consensus instance for `group` with the given membership
    ///
    /// The instance stays inert until [`start`](Self::start) runs recovery
    /// and arms the election timer.
    pub fn new(
        self_id: NodeId,
        group: GroupId,
        conf: GroupConfiguration,
        config: RaftConfig,
        log: Arc<dyn Log>,
        clients: Arc<ClientCache>,
        leadership_tx: mpsc::UnboundedSender<LeadershipStatus>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let jitter = TimeoutJitter::from_config(&config);
        Arc::new_cyclic(|weak_self| Self {
            self_id,
            group,
            config,
            jitter,
            log,
            clients,
            leadership_tx,
            state: Mutex::new(GroupState {
                vstate: VoteState::Follower,
                meta: ProtocolMetadata::default(),
                conf,
                voted_for: None,
                leader: None,
            }),
            gate: Gate::new(),
            hooks: parking_lot::RwLock::new(Vec::new()),
            timer_reset: Notify::new(),
            shutdown_tx,
            timer_task: parking_lot::Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Group identity
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// This node's identity
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Whether this instance currently believes itself leader
    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.vstate == VoteState::Leader
    }

    /// Current vote state
    pub async fn vote_state(&self) -> VoteState {
        self.state.lock().await.vstate
    }

    /// Snapshot of the protocol metadata
    pub async fn meta(&self) -> ProtocolMetadata {
        self.state.lock().await.meta
    }

    /// The node this group currently believes is leader
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.state.lock().await.leader
    }

    /// Current group membership
    pub async fn group_configuration(&self) -> GroupConfiguration {
        self.state.lock().await.conf.clone()
    }

    /// Register a protocol hook
    ///
    /// Hooks fire synchronously inside admitted operations, in registration
    /// order, and must outlive the instance.
    pub fn register_hook(&self, hook: Arc<dyn ProtocolHook>) {
        self.hooks.write().push(hook);
    }

    /// Recover persisted state and arm the election timer
    ///
    /// Reads the voted-for record (a corrupt record is fatal for the group)
    /// and reconciles the log markers with the durable log's recorded
    /// offsets.
    pub async fn start(&self) -> Result<()> {
        let record = voted_for::recover(self.log.base_directory()).await?;
        {
            let mut st = self.state.lock().await;
            st.voted_for = record.voted_for;
            if record.term > st.meta.term {
                st.meta.term = record.term;
            }
            st.meta.last_log_offset = self.log.committed_offset();
            st.meta.last_log_term = match st.meta.last_log_offset {
                0 => Term::default(),
                tail => self.log.term_at(tail).await?.unwrap_or_default(),
            };
            info!(
                group = %self.group,
                term = st.meta.term.value(),
                last_log_offset = st.meta.last_log_offset,
                "consensus instance recovered"
            );
        }
        self.spawn_election_timer();
        Ok(())
    }

    /// Stop all communications
    ///
    /// Closes the admission gate (draining in-flight operations, refusing
    /// new ones), stops the election timer, and settles to follower.
    pub async fn stop(&self) {
        debug!(group = %self.group, "stopping consensus instance");
        let _ = self.shutdown_tx.send(true);
        self.gate.close().await;
        let task = self.timer_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut st = self.state.lock().await;
        if st.vstate != VoteState::Follower {
            let term = st.meta.term;
            self.become_follower(&mut st, term, None);
        }
    }

    /// Handle a vote request
    pub async fn vote(&self, request: VoteRequest) -> Result<VoteReply> {
        let _gate = self.gate.enter()?;
        let mut st = self.state.lock().await;
        self.do_vote(&mut st, request).await
    }

    /// Handle an append-entries request (heartbeats included)
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        let _gate = self.gate.enter()?;
        let mut st = self.state.lock().await;
        self.do_append_entries(&mut st, request).await
    }

    /// Initiate an election for the next term
    ///
    /// Driven by the election timer; exposed so callers can force a
    /// campaign. A no-op while leader.
    pub async fn dispatch_vote(&self) -> Result<()> {
        let _gate = self.gate.enter()?;
        let mut st = self.state.lock().await;
        if st.vstate == VoteState::Leader {
            return Ok(());
        }
        self.do_dispatch_vote(&mut st).await
    }

    /// Process one reply from a batched heartbeat
    ///
    /// Followers handle heartbeats as ordinary zero-entry append-entries;
    /// the reply path only needs the higher-term check that demotes a stale
    /// leader.
    pub async fn process_heartbeat_reply(&self, reply: AppendEntriesReply) -> Result<()> {
        let _gate = self.gate.enter()?;
        let mut st = self.state.lock().await;
        if reply.term > st.meta.term {
            warn!(
                group = %self.group,
                term = st.meta.term.value(),
                reply_term = reply.term.value(),
                "heartbeat reply carries higher term, stepping down"
            );
            self.become_follower(&mut st, reply.term, None);
        }
        Ok(())
    }

    /// Force leader/candidate down to follower
    ///
    /// Does not touch the persisted vote record; any in-flight election is
    /// invalidated by the state change.
    pub async fn step_down(&self) -> Result<()> {
        let _gate = self.gate.enter()?;
        let mut st = self.state.lock().await;
        if st.vstate != VoteState::Follower {
            info!(group = %self.group, state = %st.vstate, "stepping down");
            let term = st.meta.term;
            self.become_follower(&mut st, term, None);
        }
        Ok(())
    }

    /// Build this tick's heartbeat for every follower, if currently leader
    pub(crate) async fn heartbeat_round(&self) -> Option<(Vec<NodeId>, AppendEntriesRequest)> {
        let st = self.state.lock().await;
        if st.vstate != VoteState::Leader {
            return None;
        }
        let peers: Vec<NodeId> =
            st.conf.nodes.iter().copied().filter(|n| *n != self.self_id).collect();
        if peers.is_empty() {
            return None;
        }
        let request = AppendEntriesRequest {
            group: self.group,
            term: st.meta.term,
            leader_id: self.self_id,
            prev_log_offset: st.meta.last_log_offset,
            prev_log_term: st.meta.last_log_term,
            entries: Vec::new(),
            leader_commit: st.meta.commit_offset,
        };
        Some((peers, request))
    }

    async fn do_vote(&self, st: &mut GroupState, request: VoteRequest) -> Result<VoteReply> {
        if request.term < st.meta.term {
            debug!(
                group = %self.group,
                term = st.meta.term.value(),
                candidate = %request.candidate_id,
                stale_term = request.term.value(),
                "rejecting vote request with stale term"
            );
            return Ok(VoteReply { group: self.group, term: st.meta.term, granted: false });
        }
        if request.term > st.meta.term {
            self.become_follower(st, request.term, None);
        }
        // Any valid vote interaction defers our own candidacy.
        self.timer_reset.notify_one();

        let log_ok = request.last_log_term > st.meta.last_log_term
            || (request.last_log_term == st.meta.last_log_term
                && request.last_log_offset >= st.meta.last_log_offset);
        let granted = log_ok && st.voted_for.map_or(true, |v| v == request.candidate_id);

        if granted && st.voted_for.is_none() {
            // The vote must be on disk before the reply is observable.
            voted_for::persist(
                self.log.base_directory(),
                &VotedFor { voted_for: Some(request.candidate_id), term: st.meta.term },
            )
            .await?;
            st.voted_for = Some(request.candidate_id);
            info!(
                group = %self.group,
                term = st.meta.term.value(),
                candidate = %request.candidate_id,
                "granted vote"
            );
        } else if !granted {
            debug!(
                group = %self.group,
                term = st.meta.term.value(),
                candidate = %request.candidate_id,
                log_ok,
                voted_for = ?st.voted_for,
                "denied vote"
            );
        }
        Ok(VoteReply { group: self.group, term: st.meta.term, granted })
    }

    async fn do_append_entries(
        &self,
        st: &mut GroupState,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        if request.term < st.meta.term {
            debug!(
                group = %self.group,
                term = st.meta.term.value(),
                stale_term = request.term.value(),
                sender = %request.leader_id,
                "rejecting append-entries with stale term"
            );
            return Ok(self.append_reply(st, false));
        }

        // The sender is the legitimate leader for this term.
        self.become_follower(st, request.term, Some(request.leader_id));
        self.timer_reset.notify_one();

        if request.prev_log_offset > st.meta.last_log_offset {
            trace!(
                group = %self.group,
                prev_log_offset = request.prev_log_offset,
                last_log_offset = st.meta.last_log_offset,
                "log behind leader, asking for earlier offset"
            );
            return Ok(self.append_reply(st, false));
        }

        if request.prev_log_offset > 0 {
            let local_term = self.log.term_at(request.prev_log_offset).await?;
            if local_term != Some(request.prev_log_term) {
                // Committed entries never disagree with the leader; a
                // conflict at or below the commit offset is rejected
                // instead of applied.
                if request.prev_log_offset <= st.meta.commit_offset {
                    warn!(
                        group = %self.group,
                        prev_log_offset = request.prev_log_offset,
                        commit_offset = st.meta.commit_offset,
                        "append-entries conflicts with committed entries, rejecting"
                    );
                    return Ok(self.append_reply(st, false));
                }
                // Conflicting suffix: drop it and report the new tail as the
                // retry hint.
                self.log.truncate(request.prev_log_offset).await?;
                st.meta.last_log_offset = self.log.committed_offset();
                st.meta.last_log_term = match st.meta.last_log_offset {
                    0 => Term::default(),
                    tail => self.log.term_at(tail).await?.unwrap_or_default(),
                };
                debug!(
                    group = %self.group,
                    prev_log_offset = request.prev_log_offset,
                    prev_log_term = request.prev_log_term.value(),
                    local_term = ?local_term,
                    "previous entry mismatch, truncated conflicting suffix"
                );
                return Ok(self.append_reply(st, false));
            }
        }

        let mut entries = request.entries;
        // A duplicate or late retransmission may carry entries the log
        // already holds. Skip the stored prefix and only touch the tail
        // from the first entry whose term disagrees.
        let mut next = request.prev_log_offset + 1;
        let mut matched = 0;
        while matched < entries.len() && next <= st.meta.last_log_offset {
            if self.log.term_at(next).await? != Some(entries[matched].term) {
                break;
            }
            matched += 1;
            next += 1;
        }
        entries.drain(..matched);

        if !entries.is_empty() {
            if next <= st.meta.commit_offset {
                warn!(
                    group = %self.group,
                    offset = next,
                    commit_offset = st.meta.commit_offset,
                    "append-entries conflicts with committed entries, rejecting"
                );
                return Ok(self.append_reply(st, false));
            }
            // Stale tail past the match point is overwritten.
            if next <= st.meta.last_log_offset {
                self.log.truncate(next).await?;
                st.meta.last_log_offset = next - 1;
                st.meta.last_log_term = match st.meta.last_log_offset {
                    0 => Term::default(),
                    tail => self.log.term_at(tail).await?.unwrap_or_default(),
                };
            }

            let begin = st.meta.last_log_offset + 1;
            let tail_term = entries.last().map(|e| e.term);
            self.hooks_pre_commit(begin, &entries);

            match self.disk_append(entries).await {
                Ok(offsets) => {
                    if let Some(&tail) = offsets.last() {
                        st.meta.last_log_offset = tail;
                        if let Some(term) = tail_term {
                            st.meta.last_log_term = term;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        group = %self.group,
                        term = st.meta.term.value(),
                        error = %e,
                        "disk append failed, rolling back"
                    );
                    self.hooks_abort(begin);
                    return Ok(self.append_reply(st, false));
                }
            }
        }

        let new_commit = request.leader_commit.min(st.meta.last_log_offset);
        if new_commit > st.meta.commit_offset {
            let begin = st.meta.commit_offset + 1;
            st.meta.commit_offset = new_commit;
            trace!(
                group = %self.group,
                begin,
                committed = new_commit,
                "advancing commit offset"
            );
            self.hooks_commit(begin, new_commit);
        }

        Ok(self.append_reply(st, true))
    }

    async fn do_dispatch_vote(&self, st: &mut GroupState) -> Result<()> {
        st.meta.term = st.meta.term.next();
        st.vstate = VoteState::Candidate;
        if st.leader.take().is_some() {
            self.notify_leadership(st);
        }

        // Self-vote is persisted like any other before requests go out.
        voted_for::persist(
            self.log.base_directory(),
            &VotedFor { voted_for: Some(self.self_id), term: st.meta.term },
        )
        .await?;
        st.voted_for = Some(self.self_id);

        let term = st.meta.term;
        info!(group = %self.group, term = term.value(), "starting election");

        let request = VoteRequest {
            group: self.group,
            term,
            candidate_id: self.self_id,
            last_log_offset: st.meta.last_log_offset,
            last_log_term: st.meta.last_log_term,
        };
        let peers: Vec<NodeId> =
            st.conf.nodes.iter().copied().filter(|n| *n != self.self_id).collect();
        let majority = st.conf.majority();

        let replies = self.send_vote_requests(&peers, request).await;

        let mut granted = 1usize; // self-vote
        for reply in replies {
            if reply.term > st.meta.term {
                info!(
                    group = %self.group,
                    term = term.value(),
                    reply_term = reply.term.value(),
                    "discovered higher term, abandoning election"
                );
                self.become_follower(st, reply.term, None);
                return Ok(());
            }
            if reply.granted {
                granted += 1;
            }
        }

        if granted >= majority {
            st.vstate = VoteState::Leader;
            st.leader = Some(self.self_id);
            info!(
                group = %self.group,
                term = term.value(),
                votes = granted,
                "won election"
            );
            self.notify_leadership(st);
        } else {
            debug!(
                group = %self.group,
                term = term.value(),
                votes = granted,
                needed = majority,
                "election failed, reverting to follower"
            );
            st.vstate = VoteState::Follower;
        }
        Ok(())
    }

    /// Fan vote requests out to all peers in parallel with a bounded
    /// per-request timeout; failures and timeouts count as "no reply" and
    /// are never retried within the attempt.
    async fn send_vote_requests(&self, peers: &[NodeId], request: VoteRequest) -> Vec<VoteReply> {
        let dispatches = peers.iter().map(|peer| {
            let peer = *peer;
            let client = self.clients.get(&peer);
            let request = request.clone();
            let timeout = self.config.vote_rpc_timeout;
            async move {
                let Some(client) = client else {
                    debug!(peer = %peer, "no client for peer, counting as no reply");
                    return None;
                };
                match tokio::time::timeout(timeout, client.vote(request)).await {
                    Ok(Ok(reply)) => Some(reply),
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "vote request failed");
                        None
                    }
                    Err(_) => {
                        debug!(peer = %peer, "vote request timed out");
                        None
                    }
                }
            }
        });
        futures::future::join_all(dispatches).await.into_iter().flatten().collect()
    }

    /// Hand a batch to the durable log under the configured durability mode
    /// and disk time budget
    async fn disk_append(&self, entries: Vec<Entry>) -> Result<Vec<LogOffset>> {
        let options = AppendOptions { durability: self.config.durability };
        match tokio::time::timeout(self.config.disk_timeout, self.log.append(entries, options))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::DiskTimeout {
                timeout_ms: self.config.disk_timeout.as_millis() as u64,
            }),
        }
    }

    fn append_reply(&self, st: &GroupState, success: bool) -> AppendEntriesReply {
        AppendEntriesReply {
            group: self.group,
            term: st.meta.term,
            success,
            last_matched_offset: st.meta.last_log_offset,
        }
    }

    fn become_follower(&self, st: &mut GroupState, term: Term, leader: Option<NodeId>) {
        if term > st.meta.term {
            st.meta.term = term;
            st.voted_for = None;
        }
        st.vstate = VoteState::Follower;
        if st.leader != leader {
            st.leader = leader;
            self.notify_leadership(st);
        }
    }

    fn notify_leadership(&self, st: &GroupState) {
        let status = LeadershipStatus {
            group: self.group,
            term: st.meta.term,
            current_leader: st.leader,
        };
        if self.leadership_tx.send(status).is_err() {
            trace!(group = %self.group, "leadership observer channel closed");
        }
    }

    fn hooks_pre_commit(&self, begin: LogOffset, entries: &[Entry]) {
        for hook in self.hooks.read().iter() {
            hook.pre_commit(begin, entries);
        }
    }

    fn hooks_abort(&self, begin: LogOffset) {
        for hook in self.hooks.read().iter() {
            hook.abort(begin);
        }
    }

    fn hooks_commit(&self, begin: LogOffset, committed: LogOffset) {
        for hook in self.hooks.read().iter() {
            hook.commit(begin, committed);
        }
    }

    /// Follower-side election trigger: campaign whenever the jittered window
    /// elapses without a heartbeat or vote interaction resetting it.
    fn spawn_election_timer(&self) {
        let weak = self.weak_self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let Some(raft) = weak.upgrade() else { break };
                let timeout = raft.jitter.next_timeout();
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        match raft.dispatch_vote().await {
                            Ok(()) => {}
                            Err(Error::ShuttingDown) => break,
                            Err(e) => {
                                debug!(group = %raft.group, error = %e, "election dispatch failed");
                            }
                        }
                    }
                    _ = raft.timer_reset.notified() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.timer_task.lock() = Some(task);
    }
}

impl fmt::Debug for Consensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consensus")
            .field("self_id", &self.self_id)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}
