//! # Consensus Configuration
//!
//! Timing and durability parameters for consensus instances.
//!
//! The config is an immutable snapshot taken at construction time: a running
//! group's timing behavior stays stable across dynamic configuration changes
//! until the group is restarted.

use crate::error::{Error, Result};
use crate::storage::Durability;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration snapshot for a consensus instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// Lower values reduce failover time but increase split vote probability.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    ///
    /// Upper bound of the jitter window used to desynchronize elections
    /// across nodes.
    pub election_timeout_max: Duration,

    /// Interval between batched leader heartbeats
    pub heartbeat_interval: Duration,

    /// Time budget for a single durable-append operation
    pub disk_timeout: Duration,

    /// Per-request timeout for vote RPCs during an election attempt
    pub vote_rpc_timeout: Duration,

    /// Durability mode handed to the log on every append
    pub durability: Durability,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            disk_timeout: Duration::from_secs(1),
            vote_rpc_timeout: Duration::from_millis(100),
            durability: Durability::Fsync,
        }
    }
}

impl RaftConfig {
    /// Validate internal consistency of the snapshot
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(Error::Configuration(
                "election_timeout_min exceeds election_timeout_max".to_string(),
            ));
        }
        if self.election_timeout_min.is_zero() {
            return Err(Error::Configuration(
                "election_timeout_min must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Configuration(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(Error::Configuration(
                "heartbeat_interval must stay below election_timeout_min".to_string(),
            ));
        }
        Ok(())
    }
}
