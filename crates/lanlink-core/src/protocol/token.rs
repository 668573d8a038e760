//! Per-connection RPC token counter.
//!
//! Every call that expects a reply carries a token; the reply echoes it so
//! the caller can correlate the two. Tokens are unique and increasing within
//! one connection's lifetime and are never reused after a reply completes.
//! Allocation is atomic so any task holding the connection may issue calls
//! concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter handing out RPC tokens.
///
/// Tokens start at 1; an accidentally defaulted integer field on the wire
/// can therefore never correlate with a real call.
///
/// # Examples
///
/// ```rust
/// use lanlink_core::TokenCounter;
///
/// let tokens = TokenCounter::new();
/// assert_eq!(tokens.next(), 1);
/// assert_eq!(tokens.next(), 2);
/// ```
#[derive(Debug)]
pub struct TokenCounter {
    inner: AtomicU64,
}

impl TokenCounter {
    /// Creates a counter whose first token is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next token and advances the counter.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
