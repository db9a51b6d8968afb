//! # Jittered Timeouts
//!
//! Randomized election timeout generation. Drawing each timeout from a range
//! rather than a fixed value keeps nodes from starting synchronized elections
//! after a shared leader failure.

use crate::config::RaftConfig;
use rand::Rng;
use std::time::Duration;

/// Generator of randomized timeout durations within a configured range
#[derive(Debug, Clone, Copy)]
pub struct TimeoutJitter {
    min: Duration,
    max: Duration,
}

impl TimeoutJitter {
    /// Create a jitter source over `[min, max]`
    ///
    /// An inverted range collapses to the fixed value `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min) }
    }

    /// Create a jitter source from a config snapshot's election timeout range
    pub fn from_config(config: &RaftConfig) -> Self {
        Self::new(config.election_timeout_min, config.election_timeout_max)
    }

    /// Draw the next randomized timeout
    pub fn next_timeout(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    /// Lower bound of the jitter window
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound of the jitter window
    pub fn max(&self) -> Duration {
        self.max
    }
}
