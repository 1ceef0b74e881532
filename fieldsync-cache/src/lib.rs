//! Local cache with explicit freshness and declared invalidation.
//!
//! Cached values are never handed out without their stale flag: reads return
//! a [`CacheRead`] and callers pick their tolerance with [`Freshness`].
//! Invalidation marks entries stale without dropping their value, so a
//! surface can keep rendering the last known state while a refetch for it is
//! pending.
//!
//! # Ordering
//!
//! Every write and every issued fetch takes a [`Sequence`] from the cache's
//! [`SequenceSource`]. A fetch commits only if no newer write or fetch
//! touched the entry after it was issued, so a slow refetch can never clobber
//! a mutation that committed in the meantime.
//!
//! # Example
//!
//! ```ignore
//! let cache = LocalCache::new();
//! let graph = InvalidationGraph::new(cache.clone());
//! graph.declare(KeyPrefix::new("materials"), [KeyPrefix::new("allocations")]);
//!
//! let guard = cache.observe(CacheKey::detail("materials", "M1"), fetcher).await?;
//! if let Some(read) = guard.read() {
//!     if read.is_stale() {
//!         tracing::debug!("rendering previous value while refetching");
//!     }
//! }
//!
//! let report = graph.apply(&KeyPrefix::new("materials")).await;
//! ```

pub mod fetcher;
pub mod freshness;
pub mod graph;
pub mod local;
pub mod sequence;

pub use fetcher::{FnFetcher, QueryFetcher};
pub use freshness::{CacheRead, Freshness};
pub use graph::{
    InvalidationGap, InvalidationGraph, InvalidationPlan, InvalidationReport, InvalidationRule,
};
pub use local::{
    merge_shallow, CacheEntry, CacheStats, LocalCache, ObserverGuard, RefetchOutcome, Snapshot,
};
pub use sequence::{Sequence, SequenceSource};
