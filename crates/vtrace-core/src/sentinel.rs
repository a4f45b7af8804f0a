#![forbid(unsafe_code)]

//! Interaction sequence counter scoped to one root node.
//!
//! A [`Sentinel`] lives only on nodes that act as a root (a page marked as
//! root page, or the absolute root of a tree). Descendants share it through
//! an `Arc` and draw sequence numbers from it on every qualifying
//! interaction. Re-exposure of the owning root resets it.
//!
//! # Invariants
//!
//! 1. After `reset()`, `k` calls to `next()` return exactly `1..=k`, in call
//!    order, with no duplicates or gaps, even when callers race.
//! 2. `current()` never exceeds the number of `next()` calls since the last reset.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic, thread-safe interaction counter.
#[derive(Debug, Default)]
pub struct Sentinel {
    value: AtomicU64,
}

impl Sentinel {
    /// Create a counter at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment and return the new value (first call after reset returns 1).
    #[inline]
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The most recently handed out value, or 0 after a reset.
    #[inline]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Restart the sequence. The next call to [`next`](Self::next) returns 1.
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}
