//! Optimistic mutations with snapshot and rollback.
//!
//! Every user-initiated write goes through [`MutationCoordinator::mutate`]:
//!
//! 1. cancel reads in flight for the target (and patched list entries),
//! 2. snapshot them,
//! 3. write the optimistic value,
//! 4. run the request,
//! 5. on success store the server's value and apply the invalidation graph
//!    for the mutation's domain, leaving the committed target fresh,
//! 6. on failure restore the snapshots and return the error.
//!
//! Steps 1 to 3 run without yielding, so a second mutation of the same key
//! snapshots the first one's optimistic value, not the original.
//!
//! A rollback only touches entries still holding this mutation's optimistic
//! write; a server value committed in the meantime is kept. Dropping the
//! `mutate` future before it settles (a timeout, a lost `select!` branch)
//! rolls back the same way as a failed request.

use fieldsync_cache::{
    merge_shallow, InvalidationGraph, InvalidationReport, LocalCache, Sequence, Snapshot,
};
use fieldsync_core::{CacheKey, KeyPrefix, MutationError, RequestError, RetryConfig};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How the optimistic value is written.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimistic {
    /// Replace the entry.
    Replace(Value),
    /// `{...current, ...patch}`.
    Merge(Value),
    /// Leave the cache alone until the server answers.
    None,
}

/// A write request against one cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    target: CacheKey,
    optimistic: Optimistic,
    domain: Option<KeyPrefix>,
    list_prefix: Option<KeyPrefix>,
    idempotent: bool,
    delete: bool,
}

impl Mutation {
    /// Replace `target` with `optimistic` until the server answers.
    pub fn new(target: CacheKey, optimistic: Value) -> Self {
        Self::with_optimistic(target, Optimistic::Replace(optimistic))
    }

    /// Shallow-merge `patch` into the current value of `target`.
    pub fn merge(target: CacheKey, patch: Value) -> Self {
        Self::with_optimistic(target, Optimistic::Merge(patch))
    }

    /// Delete the entity behind `target`. Its key is removed on success.
    pub fn delete(target: CacheKey) -> Self {
        Self {
            delete: true,
            ..Self::with_optimistic(target, Optimistic::None)
        }
    }

    pub fn with_optimistic(target: CacheKey, optimistic: Optimistic) -> Self {
        Self {
            target,
            optimistic,
            domain: None,
            list_prefix: None,
            idempotent: false,
            delete: false,
        }
    }

    /// Domain whose invalidation rule runs on success. Defaults to the
    /// target's domain.
    pub fn affects(mut self, domain: KeyPrefix) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Also patch the row with the target's id inside list entries under
    /// `prefix`.
    pub fn patch_lists(mut self, prefix: KeyPrefix) -> Self {
        self.list_prefix = Some(prefix);
        self
    }

    /// Allow retrying retryable failures.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn target(&self) -> &CacheKey {
        &self.target
    }

    pub fn domain(&self) -> KeyPrefix {
        self.domain
            .clone()
            .unwrap_or_else(|| KeyPrefix::new(self.target.domain()))
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}

/// Rollback state of one mutation in flight. Restores on drop unless
/// committed.
struct MutationIntent {
    cache: LocalCache,
    target: CacheKey,
    /// Snapshot of the target and the sequence of the optimistic write
    /// that replaced it.
    snapshot: Option<(Snapshot, Sequence)>,
    lists: Vec<(CacheKey, Snapshot, Sequence)>,
    /// Lists holding a row of the target, patched with the server value on
    /// commit.
    list_keys: Vec<CacheKey>,
    settled: bool,
}

impl MutationIntent {
    fn commit(mut self) {
        self.settled = true;
    }

    fn rollback(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Some((snapshot, owner)) = self.snapshot.take() {
            self.cache.restore_if_owned(&self.target, snapshot, owner);
        }
        for (key, snapshot, owner) in self.lists.drain(..) {
            self.cache.restore_if_owned(&key, snapshot, owner);
        }
    }
}

impl Drop for MutationIntent {
    fn drop(&mut self) {
        if !self.settled {
            warn!(key = %self.target, "Mutation dropped before it settled, rolling back");
            self.restore();
        }
    }
}

/// Retry delay after failed attempt number `attempt` (0-based):
/// `min(initial_ms * 2^attempt, max_ms)`.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(factor.saturating_mul(config.initial_ms).min(config.max_ms))
}

#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    graph: InvalidationGraph,
    retry: RetryConfig,
}

impl MutationCoordinator {
    pub fn new(graph: InvalidationGraph, retry: RetryConfig) -> Self {
        Self { graph, retry }
    }

    pub fn cache(&self) -> &LocalCache {
        self.graph.cache()
    }

    /// Run `mutation`, issuing the remote write with `request`.
    ///
    /// `request` is called once, or up to `retry.max_retries` more times for
    /// idempotent mutations failing with a retryable error. The returned
    /// value is the server's; on error the cache is already rolled back.
    pub async fn mutate<F, Fut>(
        &self,
        mutation: Mutation,
        request: F,
    ) -> Result<Value, MutationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, RequestError>>,
    {
        self.mutate_with_report(mutation, request)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`mutate`](Self::mutate), also returning what the invalidation
    /// pass did.
    pub async fn mutate_with_report<F, Fut>(
        &self,
        mutation: Mutation,
        request: F,
    ) -> Result<(Value, InvalidationReport), MutationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, RequestError>>,
    {
        let intent = self.begin(&mutation);

        let value = match self.execute(&mutation, request).await {
            Ok(value) => value,
            Err((source, attempts)) => {
                intent.rollback();
                error!(
                    key = %mutation.target,
                    attempts,
                    error = %source,
                    "Mutation failed, optimistic write rolled back"
                );
                return Err(MutationError {
                    key: mutation.target,
                    attempts,
                    source,
                });
            }
        };

        let cache = self.cache();
        if mutation.delete {
            cache.remove(&mutation.target);
        } else {
            cache.set(mutation.target.clone(), value.clone());
            for key in &intent.list_keys {
                cache.patch_list_item(key, mutation.target.last(), &value);
            }
        }
        intent.commit();

        // The target already holds the server's answer; only its
        // dependents need refreshing.
        let domain = mutation.domain();
        let keep = [mutation.target.clone()];
        let report = self.graph.apply_except(&domain, &keep).await;
        info!(
            key = %mutation.target,
            domain = %domain,
            refetched = report.refetched.len(),
            "Mutation committed"
        );
        Ok((value, report))
    }

    /// Steps 1 to 3. Must not yield.
    fn begin(&self, mutation: &Mutation) -> MutationIntent {
        let cache = self.cache();
        let target = &mutation.target;
        let id = target.last();

        let list_keys: Vec<CacheKey> = mutation
            .list_prefix
            .as_ref()
            .map(|prefix| cache.list_keys_containing(prefix, id))
            .unwrap_or_default()
            .into_iter()
            .filter(|key| key != target)
            .collect();

        cache.cancel(target);
        for key in &list_keys {
            cache.cancel(key);
        }

        let snapshot = cache.snapshot(target);
        let list_snapshots: Vec<(CacheKey, Snapshot)> = list_keys
            .iter()
            .map(|key| (key.clone(), cache.snapshot(key)))
            .collect();

        let written = match &mutation.optimistic {
            Optimistic::Replace(value) => Some(value.clone()),
            Optimistic::Merge(patch) => {
                let mut merged = snapshot
                    .value()
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                merge_shallow(&mut merged, patch);
                Some(merged)
            }
            Optimistic::None => None,
        };
        let mut intent = MutationIntent {
            cache: cache.clone(),
            target: target.clone(),
            snapshot: None,
            lists: Vec::new(),
            list_keys,
            settled: false,
        };
        if let Some(value) = written {
            let owner = cache.set(target.clone(), value.clone());
            intent.snapshot = Some((snapshot, owner));
            let row_patch = match &mutation.optimistic {
                Optimistic::Merge(patch) => patch.clone(),
                _ => value,
            };
            for (key, list_snapshot) in list_snapshots {
                if let Some(owner) = cache.patch_list_item(&key, id, &row_patch) {
                    intent.lists.push((key, list_snapshot, owner));
                }
            }
            debug!(key = %target, lists = intent.lists.len(), "Applied optimistic write");
        }
        intent
    }

    async fn execute<F, Fut>(
        &self,
        mutation: &Mutation,
        mut request: F,
    ) -> Result<Value, (RequestError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, RequestError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match request().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if mutation.idempotent
                        && err.is_retryable()
                        && attempts <= self.retry.max_retries =>
                {
                    let delay = retry_delay(&self.retry, attempts - 1);
                    warn!(
                        key = %mutation.target,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying idempotent mutation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err((err, attempts)),
            }
        }
    }
}
