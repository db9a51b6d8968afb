//! # Protocol Types
//!
//! Wire-level request/reply types for the vote and append-entries RPCs,
//! plus the per-group metadata they are evaluated against.

use crate::types::{GroupId, LogOffset, NodeId, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One entry in a group's replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Position of the entry in the log (assigned by the durable log)
    pub offset: LogOffset,
    /// Term in which the entry was created
    pub term: Term,
    /// Opaque payload
    pub payload: Bytes,
}

impl Entry {
    /// Create an entry; the offset is finalized by the durable log on append
    pub fn new(term: Term, payload: impl Into<Bytes>) -> Self {
        Self { offset: 0, term, payload: payload.into() }
    }
}

/// Protocol metadata owned by one consensus instance
///
/// Mutated only while holding the instance's exclusive admission token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    /// Current term
    pub term: Term,
    /// Highest offset known committed (majority-replicated)
    pub commit_offset: LogOffset,
    /// Offset of the last entry in the local log
    pub last_log_offset: LogOffset,
    /// Term of the last entry in the local log
    pub last_log_term: Term,
}

/// Voting membership of a raft group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfiguration {
    /// Member node identities currently voting in the group
    pub nodes: Vec<NodeId>,
}

impl GroupConfiguration {
    /// Create a configuration over the given members
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }

    /// Number of votes forming a strict majority
    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// Whether the node is a voting member
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }
}

/// Vote RPC request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Target raft group
    pub group: GroupId,
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting the vote
    pub candidate_id: NodeId,
    /// Offset of the candidate's last log entry
    pub last_log_offset: LogOffset,
    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

/// Vote RPC reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    /// Raft group the reply belongs to
    pub group: GroupId,
    /// Replier's current term, for the candidate to update itself
    pub term: Term,
    /// True if the vote was granted
    pub granted: bool,
}

/// Append-entries RPC request
///
/// With no entries this doubles as the leader heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Target raft group
    pub group: GroupId,
    /// Leader's term
    pub term: Term,
    /// Leader identity for this term
    pub leader_id: NodeId,
    /// Offset of the entry immediately preceding the new ones
    pub prev_log_offset: LogOffset,
    /// Term of the entry at `prev_log_offset`
    pub prev_log_term: Term,
    /// Entries to append (empty for a heartbeat)
    pub entries: Vec<Entry>,
    /// Leader's commit offset
    pub leader_commit: LogOffset,
}

impl AppendEntriesRequest {
    /// Whether this request is a pure liveness heartbeat
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-entries RPC reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Raft group the reply belongs to
    pub group: GroupId,
    /// Replier's current term, for the leader to update itself
    pub term: Term,
    /// True if the previous-entry check passed and entries were appended
    pub success: bool,
    /// On failure, the replier's latest matchable offset; the leader retries
    /// its probe from here
    pub last_matched_offset: LogOffset,
}

/// Batched heartbeat request: one per peer per tick, covering every group the
/// sending node leads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Zero-entry append-entries requests, one per led group
    pub heartbeats: Vec<AppendEntriesRequest>,
}

/// Batched heartbeat reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    /// One reply per heartbeat in the request
    pub replies: Vec<AppendEntriesReply>,
}

/// Leadership change notification
///
/// Emitted whenever a transition changes who the group believes is leader.
/// Delivered at-least-once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipStatus {
    /// Group whose leadership changed
    pub group: GroupId,
    /// Term in which the change happened
    pub term: Term,
    /// The believed leader, if any
    pub current_leader: Option<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_arithmetic() {
        let one = GroupConfiguration::new(vec![NodeId::generate()]);
        assert_eq!(one.majority(), 1);

        let three = GroupConfiguration::new(
            (0..3).map(|_| NodeId::generate()).collect(),
        );
        assert_eq!(three.majority(), 2);

        let five = GroupConfiguration::new(
            (0..5).map(|_| NodeId::generate()).collect(),
        );
        assert_eq!(five.majority(), 3);
    }

    #[test]
    fn heartbeat_is_zero_entries() {
        let req = AppendEntriesRequest {
            group: GroupId::new(1),
            term: Term::new(1),
            leader_id: NodeId::generate(),
            prev_log_offset: 0,
            prev_log_term: Term::default(),
            entries: Vec::new(),
            leader_commit: 0,
        };
        assert!(req.is_heartbeat());

        let mut with_entries = req;
        with_entries.entries.push(Entry::new(Term::new(1), "payload"));
        assert!(!with_entries.is_heartbeat());
    }

    #[test]
    fn membership_lookup() {
        let member = NodeId::generate();
        let conf = GroupConfiguration::new(vec![member]);
        assert!(conf.contains(&member));
        assert!(!conf.contains(&NodeId::generate()));
    }
}
