//! # Protocol Hooks
//!
//! Pluggable notification surface for the commit pipeline. Higher layers
//! (state-machine appliers, offset trackers) register hooks on a consensus
//! instance and get called at well-defined points of every log mutation the
//! protocol drives; consensus never depends on them.

use crate::protocol::Entry;
use crate::types::LogOffset;

/// Observer of consensus-driven log mutations
///
/// All callbacks run synchronously inside the consensus instance's admitted
/// operation, in registration order. Implementations must not block
/// indefinitely.
pub trait ProtocolHook: Send + Sync {
    /// Entries starting at `begin` are about to be handed to the durable log
    fn pre_commit(&self, begin: LogOffset, entries: &[Entry]);

    /// The append starting at `begin` failed and is being rolled back
    fn abort(&self, begin: LogOffset);

    /// Offsets `begin..=committed` became committed
    fn commit(&self, begin: LogOffset, committed: LogOffset);
}
