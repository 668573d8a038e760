//! Async runtime substrate: single-assignment futures, the one-shot signal,
//! and the supervised task scheduler.
//!
//! Everything else in the node runs as tasks on top of these three pieces.

pub mod future;
pub mod scheduler;
pub mod signal;

pub use future::{wait_with_timeout, Completion, FutureError};
pub use scheduler::Scheduler;
pub use signal::Signal;
