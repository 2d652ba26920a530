//! Per-process request counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts accepted connections and evaluates the handoff threshold.
///
/// Owned by the [`DrainController`](crate::DrainController) and shared with the
/// accept path. `increment` is the only mutator, so the count never decreases and
/// `has_reached_threshold` never flips back to `false`. A successor process starts
/// with a fresh counter.
#[derive(Debug)]
pub struct RequestCounter {
    count: AtomicU64,
    threshold: u64,
}

impl RequestCounter {
    /// Create a counter with the given threshold. A threshold of zero is treated as one.
    pub fn new(threshold: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Record one request and return the new count.
    ///
    /// Exactly one caller observes `new_count == threshold()`, however many
    /// threads race on the increment.
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn has_reached_threshold(&self) -> bool {
        self.count() >= self.threshold
    }
}
