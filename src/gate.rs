//! # Shutdown Gate
//!
//! Drain-then-close discipline for in-flight operations: every admitted
//! operation enters the gate for its duration; `close` refuses new entrants
//! and then waits until every operation already inside has finished.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Gate tracking in-flight operations for graceful shutdown
///
/// Entrant tracking rides on channel sender clones: each [`GateGuard`] holds
/// one, and the receiver yields `None` once the last clone is dropped.
#[derive(Debug)]
pub struct Gate {
    closed: AtomicBool,
    entrants: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    drained: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

/// Proof of admission through a [`Gate`]; dropping it marks the operation done
#[derive(Debug)]
pub struct GateGuard {
    _entered: mpsc::Sender<()>,
}

impl Gate {
    /// Create an open gate
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            closed: AtomicBool::new(false),
            entrants: parking_lot::Mutex::new(Some(tx)),
            drained: tokio::sync::Mutex::new(rx),
        }
    }

    /// Enter the gate, or fail if shutdown has begun
    pub fn enter(&self) -> Result<GateGuard> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let entered = self.entrants.lock().clone().ok_or(Error::ShuttingDown)?;
        Ok(GateGuard { _entered: entered })
    }

    /// Whether `close` has begun
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new entrants and wait for everyone inside to leave
    ///
    /// Safe to call more than once; later calls return as soon as the gate is
    /// drained.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.entrants.lock().take();
        let mut drained = self.drained.lock().await;
        while drained.recv().await.is_some() {}
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
