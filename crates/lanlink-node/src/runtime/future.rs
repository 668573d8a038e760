//! Single-assignment completion cells.
//!
//! A [`Completion`] is a future-like cell with exactly one of three states:
//! pending, completed with a value, or failed with an error. The first
//! `complete`/`fail` call settles it for good; later settlement attempts are
//! rejected. Any number of waiters may register, and all of them observe the
//! settled result, so an RPC reply can satisfy both the caller and a
//! diagnostic observer without coordination.
//!
//! [`wait_with_timeout`] bounds a wait without disturbing the cell itself: a
//! timeout fails only the wrapper, and a completion that arrives after the
//! deadline still satisfies the cell's own waiters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

/// Errors surfaced to waiters of a [`Completion`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FutureError {
    /// The cell was settled with `fail`.
    #[error("{0}")]
    Failed(String),

    /// A bounded wait elapsed before the cell settled.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug)]
enum State<T> {
    Pending,
    Settled(Result<T, FutureError>),
}

#[derive(Debug)]
struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// A clonable handle to one single-assignment cell.
///
/// Clones share the cell: settling through any handle wakes waiters on all
/// of them. `T: Clone` because every waiter receives its own copy of the
/// value.
#[derive(Debug)]
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Completion<T> {
    /// Creates a pending cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                notify: Notify::new(),
            }),
        }
    }

    /// Settles the cell with a value. Returns `false` when the cell was
    /// already settled; the earlier result stands.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the cell with a failure. Returns `false` when the cell was
    /// already settled.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.settle(Err(FutureError::Failed(message.into())))
    }

    /// Returns `true` once the cell holds a result.
    pub fn is_settled(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), State::Pending)
    }

    /// Returns the settled result without waiting, or `None` while pending.
    pub fn try_result(&self) -> Option<Result<T, FutureError>> {
        match &*self.inner.state.lock().unwrap() {
            State::Pending => None,
            State::Settled(result) => Some(result.clone()),
        }
    }

    /// Waits until the cell settles and returns its result.
    pub async fn wait(&self) -> Result<T, FutureError> {
        loop {
            // Register interest before inspecting the state so a settle
            // between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    fn settle(&self, result: Result<T, FutureError>) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                State::Settled(_) => return false,
                State::Pending => *state = State::Settled(result),
            }
        }
        self.inner.notify.notify_waiters();
        true
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for `completion` to settle, failing with [`FutureError::TimedOut`]
/// after `limit`. The cell itself is untouched: a settlement that arrives
/// later still satisfies its own waiters.
pub async fn wait_with_timeout<T: Clone>(
    completion: &Completion<T>,
    limit: Duration,
) -> Result<T, FutureError> {
    match tokio::time::timeout(limit, completion.wait()).await {
        Ok(result) => result,
        Err(_) => Err(FutureError::TimedOut(limit)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
