//! One-shot wakeable gate.
//!
//! A [`Signal`] connects an event source to one waiting loop: `set()` trips
//! the gate, `wait()` returns the next time it is tripped. The discovery
//! engine uses one to turn "new host seen" into an out-of-schedule heartbeat.
//!
//! Semantics are level-triggered: a `set()` with nobody waiting is
//! remembered, and the next `wait()` returns immediately. Multiple `set()`
//! calls before a `wait()` coalesce into a single wake. With an
//! edge-triggered gate, a wake arriving between two waits of the consuming
//! loop would be lost and a freshly discovered host could go unannounced
//! until the next full heartbeat interval.
//!
//! The gate is single-consumer: one loop calls `wait()`, any number of
//! tasks may call `set()`.

use std::sync::Arc;

use tokio::sync::Notify;

/// A clonable, level-triggered wake gate. See the module docs for the
/// set-before-wait contract.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    notify: Arc<Notify>,
}

impl Signal {
    /// Creates an untripped gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the gate, waking the waiter or storing the wake for the next
    /// `wait()`.
    pub fn set(&self) {
        self.notify.notify_one();
    }

    /// Waits until the gate is tripped, consuming the stored wake if one is
    /// already present.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
