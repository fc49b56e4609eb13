//! Idempotency tracking keyed by a chunk's first tick.

use dashmap::DashSet;

/// Duplicate filter consulted by the persistence loop.
///
/// `is_processed` runs during filtering; `mark_processed` only after a
/// successful commit, so a failed write leads to full redelivery instead of
/// a silent gap.
pub trait IdempotencyTracker: Send + Sync {
    /// Whether `key` was already persisted.
    fn is_processed(&self, key: u64) -> bool;

    /// Records `key` as persisted. Atomic per key.
    fn mark_processed(&self, key: u64);
}

/// In-process tracker backed by a concurrent set.
#[derive(Default)]
pub struct MemoryIdempotencyTracker {
    keys: DashSet<u64>,
}

impl MemoryIdempotencyTracker {
    /// Creates an empty tracker.
    pub fn new() -> MemoryIdempotencyTracker {
        MemoryIdempotencyTracker::default()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether nothing has been tracked yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl IdempotencyTracker for MemoryIdempotencyTracker {
    fn is_processed(&self, key: u64) -> bool {
        self.keys.contains(&key)
    }

    fn mark_processed(&self, key: u64) {
        self.keys.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_check() {
        let tracker = MemoryIdempotencyTracker::new();
        assert!(!tracker.is_processed(8));
        tracker.mark_processed(8);
        assert!(tracker.is_processed(8));
        tracker.mark_processed(8);
        assert_eq!(tracker.len(), 1);
    }
}
