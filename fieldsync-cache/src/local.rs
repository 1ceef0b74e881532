//! The local cache of fetched and derived entities.
//!
//! Entries are JSON values keyed by [`CacheKey`]. Each entry carries its
//! freshness metadata (stale flag, fetch time), the number of live observers
//! and the fetcher that reloads it. All state changes go through this API;
//! every write takes a new [`Sequence`] so that a slow fetch can never commit
//! over a newer write.

use chrono::Utc;
use dashmap::DashMap;
use fieldsync_core::{CacheError, CacheKey, KeyPrefix, Timestamp};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::fetcher::QueryFetcher;
use crate::freshness::{CacheRead, Freshness};
use crate::sequence::{Sequence, SequenceSource};

/// Internal per-key state.
struct Slot {
    value: Option<Value>,
    fetched_at: Option<Timestamp>,
    is_stale: bool,
    observer_count: usize,
    fetcher: Option<Arc<dyn QueryFetcher>>,
    /// Latest write or issued fetch. A fetch commits only if it still owns this.
    latest: Sequence,
    /// Write that produced `value`.
    written: Sequence,
    inflight: Option<AbortHandle>,
}

impl Slot {
    fn empty(sequence: Sequence) -> Self {
        Self {
            value: None,
            fetched_at: None,
            is_stale: true,
            observer_count: 0,
            fetcher: None,
            latest: sequence,
            written: sequence,
            inflight: None,
        }
    }

    fn write(&mut self, value: Value, sequence: Sequence) {
        self.value = Some(value);
        self.fetched_at = Some(Utc::now());
        self.is_stale = false;
        self.latest = sequence;
        self.written = sequence;
        self.abort_inflight();
    }

    fn restore(&mut self, state: SnapshotState, sequence: Sequence) {
        self.value = state.value;
        self.fetched_at = state.fetched_at;
        self.is_stale = state.is_stale;
        self.latest = sequence;
        // The restored value keeps the sequence of the write that produced it.
        self.written = state.written;
        self.abort_inflight();
    }

    fn reset(&mut self, sequence: Sequence) {
        self.value = None;
        self.fetched_at = None;
        self.is_stale = true;
        self.latest = sequence;
        self.written = sequence;
        self.abort_inflight();
    }

    fn abort_inflight(&mut self) {
        if let Some(handle) = self.inflight.take() {
            handle.abort();
        }
    }
}

/// Point-in-time copy of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Option<Value>,
    pub fetched_at: Option<Timestamp>,
    pub is_stale: bool,
    pub observer_count: usize,
    pub has_fetcher: bool,
}

impl CacheEntry {
    /// At least one live surface renders this entry.
    pub fn is_active(&self) -> bool {
        self.observer_count > 0
    }
}

/// Captured state of an entry, restorable verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    state: Option<SnapshotState>,
}

#[derive(Debug, Clone, PartialEq)]
struct SnapshotState {
    value: Option<Value>,
    fetched_at: Option<Timestamp>,
    is_stale: bool,
    written: Sequence,
}

impl Snapshot {
    /// The entry did not exist when the snapshot was taken.
    pub fn is_absent(&self) -> bool {
        self.state.is_none()
    }

    pub fn value(&self) -> Option<&Value> {
        self.state.as_ref().and_then(|s| s.value.as_ref())
    }
}

/// What a refetch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    /// The fetched value was committed.
    Refetched(Sequence),
    /// Nobody observes the entry; it stays stale until observed.
    Deferred,
    /// A newer write or fetch owns the entry; the result was discarded.
    Superseded,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refetches: u64,
    /// Fetch results discarded because a newer write owned the entry.
    pub superseded: u64,
    pub entry_count: u64,
    pub active_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: DashMap<CacheKey, Slot>,
    sequence: SequenceSource,
    hits: AtomicU64,
    misses: AtomicU64,
    refetches: AtomicU64,
    superseded: AtomicU64,
}

/// Shared handle to one cache instance. Clones share state.
#[derive(Clone, Default)]
pub struct LocalCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("entries", &self.inner.entries.len())
            .field("sequence", &self.inner.sequence.current())
            .finish()
    }
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read the current value together with its stale flag.
    pub fn get(&self, key: &CacheKey) -> Option<CacheRead<Value>> {
        self.get_with(key, Freshness::AllowStale)
    }

    /// Read the current value if it satisfies `freshness`.
    pub fn get_with(&self, key: &CacheKey, freshness: Freshness) -> Option<CacheRead<Value>> {
        let read = self.inner.entries.get(key).and_then(|slot| {
            let value = slot.value.as_ref()?;
            if !freshness.accepts(slot.is_stale, slot.fetched_at) {
                return None;
            }
            Some(CacheRead::new(
                value.clone(),
                slot.fetched_at,
                slot.is_stale,
                slot.written,
            ))
        });
        let counter = if read.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        read
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|slot| CacheEntry {
            key: key.clone(),
            value: slot.value.clone(),
            fetched_at: slot.fetched_at,
            is_stale: slot.is_stale,
            observer_count: slot.observer_count,
            has_fetcher: slot.fetcher.is_some(),
        })
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn is_active(&self, key: &CacheKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map(|slot| slot.observer_count > 0)
            .unwrap_or(false)
    }

    /// Every cached key, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.inner.entries.iter().map(|slot| slot.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Keys under `prefix`, sorted.
    pub fn keys_under(&self, prefix: &KeyPrefix) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .inner
            .entries
            .iter()
            .filter(|slot| prefix.matches(slot.key()))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let active_count = self
            .inner
            .entries
            .iter()
            .filter(|slot| slot.observer_count > 0)
            .count() as u64;
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            refetches: self.inner.refetches.load(Ordering::Relaxed),
            superseded: self.inner.superseded.load(Ordering::Relaxed),
            entry_count: self.inner.entries.len() as u64,
            active_count,
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write a fresh value, superseding any fetch in flight for the key.
    pub fn set(&self, key: CacheKey, value: Value) -> Sequence {
        let sequence = self.inner.sequence.next();
        let mut slot = self
            .inner
            .entries
            .entry(key)
            .or_insert_with(|| Slot::empty(Sequence::ZERO));
        slot.write(value, sequence);
        sequence
    }

    /// Mark every entry under `prefix` stale. Values are kept so observers can
    /// keep rendering them while a refetch is pending. Fetches in flight for
    /// those entries are superseded, since they may have read pre-change data.
    pub fn invalidate(&self, prefix: &KeyPrefix) -> Vec<CacheKey> {
        self.invalidate_except(prefix, &[])
    }

    /// Like [`invalidate`](Self::invalidate), leaving the keys in `keep`
    /// untouched.
    pub fn invalidate_except(&self, prefix: &KeyPrefix, keep: &[CacheKey]) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        for mut slot in self.inner.entries.iter_mut() {
            if !prefix.matches(slot.key()) || keep.contains(slot.key()) {
                continue;
            }
            let key = slot.key().clone();
            slot.is_stale = true;
            slot.latest = self.inner.sequence.next();
            slot.abort_inflight();
            keys.push(key);
        }
        keys.sort();
        debug!(prefix = %prefix, count = keys.len(), "Invalidated cache entries");
        keys
    }

    /// Drop an entry whose entity no longer exists.
    pub fn remove(&self, key: &CacheKey) -> Option<Value> {
        let (_, mut slot) = self.inner.entries.remove(key)?;
        slot.abort_inflight();
        debug!(key = %key, "Removed cache entry");
        slot.value
    }

    /// Cancel any read in flight for `key`. Its result will be discarded.
    pub fn cancel(&self, key: &CacheKey) {
        if let Some(mut slot) = self.inner.entries.get_mut(key) {
            slot.latest = self.inner.sequence.next();
            slot.abort_inflight();
            trace!(key = %key, "Cancelled in-flight read");
        }
    }

    pub fn snapshot(&self, key: &CacheKey) -> Snapshot {
        let state = self.inner.entries.get(key).map(|slot| SnapshotState {
            value: slot.value.clone(),
            fetched_at: slot.fetched_at,
            is_stale: slot.is_stale,
            written: slot.written,
        });
        Snapshot { state }
    }

    /// Put back exactly what `snapshot` captured.
    pub fn restore(&self, key: &CacheKey, snapshot: Snapshot) -> Sequence {
        let sequence = self.inner.sequence.next();
        match snapshot.state {
            Some(state) => {
                let mut slot = self
                    .inner
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Slot::empty(Sequence::ZERO));
                slot.restore(state, sequence);
            }
            None => {
                let observed = self
                    .inner
                    .entries
                    .get(key)
                    .map(|slot| slot.observer_count > 0)
                    .unwrap_or(false);
                if observed {
                    if let Some(mut slot) = self.inner.entries.get_mut(key) {
                        slot.reset(sequence);
                    }
                } else {
                    self.remove(key);
                }
            }
        }
        sequence
    }

    /// Roll `key` back to `snapshot` only while the write at `owner` is still
    /// the one held. A newer write, such as a committed server value or a
    /// later optimistic write, is kept. If the entry was invalidated after
    /// `owner`, the restored value stays stale and is refetched when observed.
    ///
    /// Returns whether the snapshot was restored.
    pub fn restore_if_owned(&self, key: &CacheKey, snapshot: Snapshot, owner: Sequence) -> bool {
        let invalidated = {
            let Some(mut slot) = self.inner.entries.get_mut(key) else {
                debug!(key = %key, "Entry removed since snapshot, nothing to restore");
                return false;
            };
            if slot.written != owner {
                debug!(
                    key = %key,
                    owner = owner.value(),
                    written = slot.written.value(),
                    "Entry rewritten since snapshot, keeping newer value"
                );
                return false;
            }
            let invalidated = slot.is_stale;
            let sequence = self.inner.sequence.next();
            match snapshot.state {
                Some(state) => {
                    slot.restore(state, sequence);
                    slot.is_stale |= invalidated;
                }
                None if slot.observer_count > 0 => slot.reset(sequence),
                None => {
                    drop(slot);
                    self.remove(key);
                    return true;
                }
            }
            invalidated
        };
        if invalidated {
            self.spawn_refetch_if_active(key);
        }
        true
    }

    /// Drop every entry, aborting fetches in flight.
    pub fn clear(&self) {
        for mut slot in self.inner.entries.iter_mut() {
            slot.abort_inflight();
        }
        self.inner.entries.clear();
    }

    // ========================================================================
    // LIST-SHAPED ENTRIES
    // ========================================================================

    /// Keys under `prefix` whose value is a list containing an item with `id`.
    pub fn list_keys_containing(&self, prefix: &KeyPrefix, id: &str) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .inner
            .entries
            .iter()
            .filter(|slot| prefix.matches(slot.key()))
            .filter(|slot| {
                slot.value
                    .as_ref()
                    .and_then(|value| list_items(value))
                    .map(|items| items.iter().any(|item| item_has_id(item, id)))
                    .unwrap_or(false)
            })
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Shallow-merge `patch` into the list item with `id` held under `key`.
    /// Returns the sequence of the write, or `None` if no row matched.
    pub fn patch_list_item(&self, key: &CacheKey, id: &str, patch: &Value) -> Option<Sequence> {
        let mut slot = self.inner.entries.get_mut(key)?;
        let patched = slot
            .value
            .as_mut()
            .and_then(list_items_mut)
            .and_then(|items| items.iter_mut().find(|item| item_has_id(item, id)))
            .map(|item| merge_shallow(item, patch))
            .is_some();
        if !patched {
            return None;
        }
        let sequence = self.inner.sequence.next();
        slot.latest = sequence;
        slot.written = sequence;
        slot.abort_inflight();
        Some(sequence)
    }

    // ========================================================================
    // OBSERVERS AND REFETCH
    // ========================================================================

    /// Register a live observer of `key` with the fetcher that loads it.
    ///
    /// The entry is created (empty and stale) if it does not exist. Dropping
    /// the returned guard releases the observer.
    pub fn register_observer(&self, key: CacheKey, fetcher: Arc<dyn QueryFetcher>) -> ObserverGuard {
        {
            let sequence = self.inner.sequence.next();
            let mut slot = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| Slot::empty(sequence));
            slot.observer_count += 1;
            slot.fetcher = Some(fetcher);
        }
        ObserverGuard {
            cache: self.clone(),
            key,
        }
    }

    /// Observe `key`, fetching it first if it is missing or stale.
    ///
    /// If the fetch fails while a previous value exists, that value stays
    /// renderable (marked stale) and the observer is kept. If nothing can be
    /// rendered, the observer is released and the error returned.
    pub async fn observe(
        &self,
        key: CacheKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> Result<ObserverGuard, CacheError> {
        let guard = self.register_observer(key, fetcher);
        self.read_through(guard.key()).await?;
        Ok(guard)
    }

    /// Return the value, refetching first if it is missing or stale.
    pub async fn read_through(&self, key: &CacheKey) -> Result<CacheRead<Value>, CacheError> {
        let needs_fetch = self
            .inner
            .entries
            .get(key)
            .map(|slot| slot.value.is_none() || slot.is_stale)
            .unwrap_or(true);
        if needs_fetch {
            if let Err(err) = self.refetch(key).await {
                return self.get(key).ok_or(err);
            }
        }
        self.get(key).ok_or_else(|| CacheError::Missing { key: key.clone() })
    }

    /// Re-execute the entry's fetcher and commit the result unless a newer
    /// write or fetch took ownership of the entry in the meantime.
    pub async fn refetch(&self, key: &CacheKey) -> Result<RefetchOutcome, CacheError> {
        let (fetcher, sequence) = {
            let mut slot = self
                .inner
                .entries
                .get_mut(key)
                .ok_or_else(|| CacheError::Missing { key: key.clone() })?;
            let fetcher = slot
                .fetcher
                .clone()
                .ok_or_else(|| CacheError::NoFetcher { key: key.clone() })?;
            let sequence = self.inner.sequence.next();
            slot.latest = sequence;
            (fetcher, sequence)
        };
        self.inner.refetches.fetch_add(1, Ordering::Relaxed);

        match fetcher.fetch(key).await {
            Ok(value) => Ok(self.commit_fetch(key, sequence, value)),
            Err(err) => {
                warn!(key = %key, error = %err, "Refetch failed, keeping last known value");
                Err(CacheError::FetchFailed {
                    key: key.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Refetch now if the entry is observed, otherwise leave it stale for the
    /// next observer.
    pub async fn refetch_if_active(&self, key: &CacheKey) -> Result<RefetchOutcome, CacheError> {
        let active = self
            .inner
            .entries
            .get(key)
            .map(|slot| slot.observer_count > 0)
            .ok_or_else(|| CacheError::Missing { key: key.clone() })?;
        if !active {
            trace!(key = %key, "Entry not observed, deferring refetch");
            return Ok(RefetchOutcome::Deferred);
        }
        self.refetch(key).await
    }

    /// Like [`refetch_if_active`](Self::refetch_if_active) but runs on the
    /// current tokio runtime without waiting. The task is aborted if the key
    /// is cancelled, rewritten, invalidated or removed before it completes.
    /// Returns whether a refetch was started.
    pub fn spawn_refetch_if_active(&self, key: &CacheKey) -> bool {
        if !self.is_active(key) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No runtime available, refetch left to next observer");
            return false;
        };
        let cache = self.clone();
        let task_key = key.clone();
        let handle = runtime.spawn(async move {
            let _ = cache.refetch(&task_key).await;
        });
        if let Some(mut slot) = self.inner.entries.get_mut(key) {
            slot.inflight = Some(handle.abort_handle());
        }
        true
    }

    fn commit_fetch(&self, key: &CacheKey, sequence: Sequence, value: Value) -> RefetchOutcome {
        match self.inner.entries.get_mut(key) {
            Some(mut slot) if slot.latest == sequence => {
                slot.write(value, sequence);
                RefetchOutcome::Refetched(sequence)
            }
            _ => {
                self.inner.superseded.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, sequence = sequence.value(), "Discarding superseded fetch result");
                RefetchOutcome::Superseded
            }
        }
    }

    fn release_observer(&self, key: &CacheKey) {
        if let Some(mut slot) = self.inner.entries.get_mut(key) {
            slot.observer_count = slot.observer_count.saturating_sub(1);
        }
    }
}

/// A live observer of one entry. Dropping it releases the observation.
pub struct ObserverGuard {
    cache: LocalCache,
    key: CacheKey,
}

impl ObserverGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn read(&self) -> Option<CacheRead<Value>> {
        self.cache.get(&self.key)
    }
}

impl fmt::Debug for ObserverGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverGuard").field("key", &self.key).finish()
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.cache.release_observer(&self.key);
    }
}

/// `{...base, ...patch}` for JSON objects; any other shape is replaced.
pub fn merge_shallow(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(target), Some(fields)) => {
            for (field, value) in fields {
                target.insert(field.clone(), value.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}

fn list_items(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("items").and_then(Value::as_array),
        _ => None,
    }
}

fn list_items_mut(value: &mut Value) -> Option<&mut Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get_mut("items").and_then(Value::as_array_mut),
        _ => None,
    }
}

fn item_has_id(item: &Value, id: &str) -> bool {
    match item.get("id") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldsync_core::RequestError;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::{oneshot, Notify};

    /// Fetcher returning a fixed value and counting calls.
    struct StaticFetcher {
        value: Value,
        calls: AtomicU64,
    }

    impl StaticFetcher {
        fn new(value: Value) -> Arc<Self> {
            Arc::new(Self {
                value,
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryFetcher for StaticFetcher {
        async fn fetch(&self, _key: &CacheKey) -> Result<Value, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    /// Fetcher that waits for the test to release each call.
    struct GatedFetcher {
        gates: Mutex<Vec<oneshot::Receiver<Value>>>,
        started: Notify,
    }

    impl GatedFetcher {
        fn new(gate: oneshot::Receiver<Value>) -> Arc<Self> {
            Arc::new(Self {
                gates: Mutex::new(vec![gate]),
                started: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl QueryFetcher for GatedFetcher {
        async fn fetch(&self, _key: &CacheKey) -> Result<Value, RequestError> {
            self.started.notify_one();
            let gate = self.gates.lock().unwrap().remove(0);
            gate.await.map_err(|_| RequestError::Network("gate dropped".into()))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl QueryFetcher for FailingFetcher {
        async fn fetch(&self, _key: &CacheKey) -> Result<Value, RequestError> {
            Err(RequestError::Timeout)
        }
    }

    fn m1() -> CacheKey {
        CacheKey::detail("materials", "M1")
    }

    #[test]
    fn test_set_then_get_is_fresh() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        let read = cache.get(&m1()).unwrap();
        assert!(read.is_fresh());
        assert_eq!(read.value(), &json!({"stock": 10}));
    }

    #[test]
    fn test_invalidate_domain_marks_family_stale_but_keeps_values() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        cache.set(CacheKey::list("materials", &json!({})), json!([]));
        cache.set(CacheKey::detail("allocations", "A1"), json!({}));

        let keys = cache.invalidate(&KeyPrefix::new("materials"));

        assert_eq!(keys.len(), 2);
        let read = cache.get(&m1()).unwrap();
        assert!(read.is_stale());
        assert_eq!(read.value(), &json!({"stock": 10}));
        assert!(cache
            .get(&CacheKey::detail("allocations", "A1"))
            .unwrap()
            .is_fresh());
    }

    #[test]
    fn test_fresh_read_hides_stale_value() {
        let cache = LocalCache::new();
        cache.set(m1(), json!(1));
        cache.invalidate(&m1().as_prefix());
        assert!(cache.get_with(&m1(), Freshness::Fresh).is_none());
        assert!(cache.get_with(&m1(), Freshness::AllowStale).is_some());
    }

    #[test]
    fn test_remove_drops_key() {
        let cache = LocalCache::new();
        cache.set(m1(), json!(1));
        assert_eq!(cache.remove(&m1()), Some(json!(1)));
        assert!(!cache.contains(&m1()));
        assert!(cache.remove(&m1()).is_none());
    }

    #[test]
    fn test_snapshot_restore_is_verbatim() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        cache.invalidate(&m1().as_prefix());
        let snapshot = cache.snapshot(&m1());

        cache.set(m1(), json!({"stock": 9}));
        cache.restore(&m1(), snapshot);

        let entry = cache.entry(&m1()).unwrap();
        assert_eq!(entry.value, Some(json!({"stock": 10})));
        assert!(entry.is_stale);
    }

    #[test]
    fn test_restore_absent_snapshot_removes_unobserved_entry() {
        let cache = LocalCache::new();
        let snapshot = cache.snapshot(&m1());
        assert!(snapshot.is_absent());
        cache.set(m1(), json!({"stock": 1}));
        cache.restore(&m1(), snapshot);
        assert!(!cache.contains(&m1()));
    }

    #[test]
    fn test_restore_if_owned_rolls_back_own_write() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        let snapshot = cache.snapshot(&m1());
        let optimistic = cache.set(m1(), json!({"stock": 9}));

        assert!(cache.restore_if_owned(&m1(), snapshot, optimistic));
        let entry = cache.entry(&m1()).unwrap();
        assert_eq!(entry.value, Some(json!({"stock": 10})));
        assert!(!entry.is_stale);
    }

    #[test]
    fn test_restore_if_owned_keeps_newer_write() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        let snapshot = cache.snapshot(&m1());
        let optimistic = cache.set(m1(), json!({"stock": 9}));
        cache.set(m1(), json!({"stock": 8, "server": true}));

        assert!(!cache.restore_if_owned(&m1(), snapshot, optimistic));
        assert_eq!(
            cache.get(&m1()).unwrap().into_value(),
            json!({"stock": 8, "server": true})
        );
    }

    #[test]
    fn test_restore_if_owned_hands_back_to_earlier_writer() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        let first_snapshot = cache.snapshot(&m1());
        let first = cache.set(m1(), json!({"stock": 9}));
        let second_snapshot = cache.snapshot(&m1());
        let second = cache.set(m1(), json!({"stock": 8}));

        assert!(cache.restore_if_owned(&m1(), second_snapshot, second));
        assert!(cache.restore_if_owned(&m1(), first_snapshot, first));
        assert_eq!(cache.get(&m1()).unwrap().into_value(), json!({"stock": 10}));
    }

    #[test]
    fn test_restore_if_owned_keeps_later_invalidation() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        let snapshot = cache.snapshot(&m1());
        let optimistic = cache.set(m1(), json!({"stock": 9}));
        cache.invalidate(&KeyPrefix::new("materials"));

        assert!(cache.restore_if_owned(&m1(), snapshot, optimistic));
        let entry = cache.entry(&m1()).unwrap();
        assert_eq!(entry.value, Some(json!({"stock": 10})));
        assert!(entry.is_stale);
    }

    #[test]
    fn test_invalidate_except_skips_kept_keys() {
        let cache = LocalCache::new();
        let m2 = CacheKey::detail("materials", "M2");
        cache.set(m1(), json!(1));
        cache.set(m2.clone(), json!(2));

        let keys = cache.invalidate_except(&KeyPrefix::new("materials"), &[m1()]);
        assert_eq!(keys, vec![m2.clone()]);
        assert!(cache.get(&m1()).unwrap().is_fresh());
        assert!(cache.get(&m2).unwrap().is_stale());
    }

    #[test]
    fn test_observer_guard_counts() {
        let cache = LocalCache::new();
        let fetcher = StaticFetcher::new(json!(1));
        let a = cache.register_observer(m1(), fetcher.clone());
        let b = cache.register_observer(m1(), fetcher);
        assert_eq!(cache.entry(&m1()).unwrap().observer_count, 2);
        drop(a);
        assert!(cache.is_active(&m1()));
        drop(b);
        assert!(!cache.is_active(&m1()));
    }

    #[tokio::test]
    async fn test_observe_fetches_missing_entry() {
        let cache = LocalCache::new();
        let fetcher = StaticFetcher::new(json!({"stock": 10}));
        let guard = cache.observe(m1(), fetcher.clone()).await.unwrap();
        assert_eq!(guard.read().unwrap().value(), &json!({"stock": 10}));
        assert_eq!(fetcher.calls(), 1);

        // A fresh entry is not refetched by a second observer.
        let _second = cache.observe(m1(), fetcher.clone()).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_observe_failure_without_value_releases_observer() {
        let cache = LocalCache::new();
        let result = cache.observe(m1(), Arc::new(FailingFetcher)).await;
        assert!(matches!(result, Err(CacheError::FetchFailed { .. })));
        assert!(!cache.is_active(&m1()));
    }

    #[tokio::test]
    async fn test_observe_failure_with_stale_value_keeps_rendering() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        cache.invalidate(&m1().as_prefix());
        let guard = cache.observe(m1(), Arc::new(FailingFetcher)).await.unwrap();
        let read = guard.read().unwrap();
        assert!(read.is_stale());
        assert_eq!(read.value(), &json!({"stock": 10}));
    }

    #[tokio::test]
    async fn test_refetch_if_active_defers_unobserved() {
        let cache = LocalCache::new();
        let fetcher = StaticFetcher::new(json!(2));
        let guard = cache.observe(m1(), fetcher.clone()).await.unwrap();
        drop(guard);
        cache.invalidate(&m1().as_prefix());

        let outcome = cache.refetch_if_active(&m1()).await.unwrap();
        assert_eq!(outcome, RefetchOutcome::Deferred);
        assert!(cache.get(&m1()).unwrap().is_stale());
        assert_eq!(fetcher.calls(), 1);

        // Next observer picks it up lazily.
        let _guard = cache.observe(m1(), fetcher.clone()).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.get(&m1()).unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_refetch_if_active_missing_key() {
        let cache = LocalCache::new();
        assert!(matches!(
            cache.refetch_if_active(&m1()).await,
            Err(CacheError::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_refetch_does_not_clobber_newer_write() {
        let cache = LocalCache::new();
        let (tx, rx) = oneshot::channel();
        let fetcher = GatedFetcher::new(rx);
        let _guard = cache.register_observer(m1(), fetcher.clone());

        let refetch = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refetch(&m1()).await })
        };
        fetcher.started.notified().await;

        // A mutation commits while the fetch is still in flight.
        cache.set(m1(), json!({"stock": 9, "unit": "m"}));
        tx.send(json!({"stock": 10})).unwrap();

        let outcome = refetch.await.unwrap().unwrap();
        assert_eq!(outcome, RefetchOutcome::Superseded);
        assert_eq!(
            cache.get(&m1()).unwrap().into_value(),
            json!({"stock": 9, "unit": "m"})
        );
        assert_eq!(cache.stats().superseded, 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_inflight_result() {
        let cache = LocalCache::new();
        cache.set(m1(), json!({"stock": 10}));
        let (tx, rx) = oneshot::channel();
        let fetcher = GatedFetcher::new(rx);
        let _guard = cache.register_observer(m1(), fetcher.clone());
        let refetch = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refetch(&m1()).await })
        };
        fetcher.started.notified().await;
        cache.cancel(&m1());
        tx.send(json!({"stock": 0})).unwrap();

        assert_eq!(refetch.await.unwrap().unwrap(), RefetchOutcome::Superseded);
        assert_eq!(cache.get(&m1()).unwrap().into_value(), json!({"stock": 10}));
    }

    #[tokio::test]
    async fn test_spawned_refetch_commits() {
        let cache = LocalCache::new();
        let fetcher = StaticFetcher::new(json!({"stock": 3}));
        let _guard = cache.register_observer(m1(), fetcher.clone());
        assert!(cache.spawn_refetch_if_active(&m1()));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.get(&m1()).unwrap().into_value(), json!({"stock": 3}));
    }

    #[test]
    fn test_patch_list_item_merges_matching_row() {
        let cache = LocalCache::new();
        let list_key = CacheKey::list("materials", &json!({}));
        cache.set(
            list_key.clone(),
            json!([{"id": "M1", "stock": 10, "unit": "m"}, {"id": "M2", "stock": 4}]),
        );
        cache.set(
            CacheKey::new("materials").with("warehouse"),
            json!({"items": [{"id": "M1", "stock": 10}], "total": 1}),
        );

        let keys = cache.list_keys_containing(&KeyPrefix::new("materials"), "M1");
        assert_eq!(keys.len(), 2);
        for key in &keys {
            assert!(cache.patch_list_item(key, "M1", &json!({"stock": 9})).is_some());
        }

        assert_eq!(
            cache.get(&list_key).unwrap().into_value(),
            json!([{"id": "M1", "stock": 9, "unit": "m"}, {"id": "M2", "stock": 4}])
        );
        assert_eq!(
            cache
                .get(&CacheKey::new("materials").with("warehouse"))
                .unwrap()
                .into_value()["items"][0]["stock"],
            9
        );
    }

    #[test]
    fn test_merge_shallow_replaces_non_objects() {
        let mut base = json!({"a": 1, "b": 2});
        merge_shallow(&mut base, &json!({"b": 3}));
        assert_eq!(base, json!({"a": 1, "b": 3}));

        let mut scalar = json!(5);
        merge_shallow(&mut scalar, &json!({"a": 1}));
        assert_eq!(scalar, json!({"a": 1}));
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = LocalCache::new();
        cache.set(m1(), json!(1));
        let _ = cache.get(&m1());
        let _ = cache.get(&CacheKey::detail("materials", "M9"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 0.001);
    }
}
