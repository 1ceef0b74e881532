//! Request sequence numbers for ordering cache writes.
//!
//! Every write to an entry and every fetch issued for it takes a fresh
//! sequence number from one [`SequenceSource`]. A fetch may commit its result
//! only if the entry's latest sequence is still the one the fetch was issued
//! with; anything written in between wins.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point in the cache's write history.
///
/// Sequences are monotonically increasing within one cache instance and can
/// be compared to decide which of two writes happened later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence(u64);

impl Sequence {
    /// The sequence before any write.
    pub const ZERO: Sequence = Sequence(0);

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Check if this sequence is newer than another.
    pub fn is_newer_than(&self, other: &Sequence) -> bool {
        self.0 > other.0
    }
}

/// Monotonic source of [`Sequence`] values.
#[derive(Debug, Default)]
pub struct SequenceSource {
    last: AtomicU64,
}

impl SequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Sequence {
        Sequence(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current(&self) -> Sequence {
        Sequence(self.last.load(Ordering::SeqCst))
    }
}
