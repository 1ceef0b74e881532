//! Declared invalidation rules.
//!
//! One table maps an affected domain to the derived domains that read from
//! it. Both the mutation path and the inbound-event path go through
//! [`InvalidationGraph::apply`], so the same logical change always has the
//! same cache effect regardless of who made it.
//!
//! Rules are not closed transitively. If `work-entries` feeds `projects` and
//! `projects` feeds `reports`, the `work-entries` rule must list `reports`
//! itself.

use dashmap::DashMap;
use fieldsync_core::{CacheError, CacheKey, KeyPrefix};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::local::{LocalCache, RefetchOutcome};

/// `{ affected, dependents[] }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRule {
    pub affected: KeyPrefix,
    pub dependents: Vec<KeyPrefix>,
}

impl InvalidationRule {
    pub fn new(affected: KeyPrefix, dependents: impl IntoIterator<Item = KeyPrefix>) -> Self {
        Self {
            affected,
            dependents: dependents.into_iter().collect(),
        }
    }

    /// The affected domain followed by its dependents, without duplicates.
    pub fn targets(&self) -> Vec<KeyPrefix> {
        let mut seen = HashSet::new();
        std::iter::once(&self.affected)
            .chain(self.dependents.iter())
            .filter(|prefix| seen.insert((*prefix).clone()))
            .cloned()
            .collect()
    }
}

/// Keys marked stale by one invalidation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub domain: KeyPrefix,
    pub declared: bool,
    pub invalidated: Vec<CacheKey>,
}

/// Outcome of [`InvalidationGraph::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    pub invalidated: Vec<CacheKey>,
    pub refetched: Vec<CacheKey>,
    /// Stale but unobserved; refetched on next observe.
    pub deferred: Vec<CacheKey>,
    /// Refetch result dropped because something newer committed first.
    pub superseded: Vec<CacheKey>,
    pub failed: Vec<(CacheKey, CacheError)>,
}

impl InvalidationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A place where staleness can leak because no rule covers it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum InvalidationGap {
    /// A dependent that no declared domain covers. Applying it directly is a
    /// no-op.
    UndeclaredDependent {
        affected: KeyPrefix,
        dependent: KeyPrefix,
    },
    /// A domain with cached entries but no rule of its own.
    UndeclaredCachedDomain { domain: KeyPrefix },
}

/// The rule table plus the cache it drives.
#[derive(Debug, Clone)]
pub struct InvalidationGraph {
    cache: LocalCache,
    rules: Arc<DashMap<KeyPrefix, Vec<KeyPrefix>>>,
}

impl InvalidationGraph {
    pub fn new(cache: LocalCache) -> Self {
        Self {
            cache,
            rules: Default::default(),
        }
    }

    pub fn with_rules(cache: LocalCache, rules: impl IntoIterator<Item = InvalidationRule>) -> Self {
        let graph = Self::new(cache);
        for rule in rules {
            graph.declare(rule.affected, rule.dependents);
        }
        graph
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Declare (or replace) the dependents of `affected`.
    pub fn declare(&self, affected: KeyPrefix, dependents: impl IntoIterator<Item = KeyPrefix>) {
        let dependents: Vec<KeyPrefix> = dependents.into_iter().collect();
        debug!(domain = %affected, dependents = dependents.len(), "Declared invalidation rule");
        self.rules.insert(affected, dependents);
    }

    pub fn is_declared(&self, domain: &KeyPrefix) -> bool {
        self.rules.contains_key(domain)
    }

    pub fn rule(&self, domain: &KeyPrefix) -> Option<InvalidationRule> {
        self.rules
            .get(domain)
            .map(|dependents| InvalidationRule::new(domain.clone(), dependents.iter().cloned()))
    }

    /// All rules, ordered by affected domain.
    pub fn rules(&self) -> Vec<InvalidationRule> {
        let mut rules: Vec<InvalidationRule> = self
            .rules
            .iter()
            .map(|entry| InvalidationRule::new(entry.key().clone(), entry.value().iter().cloned()))
            .collect();
        rules.sort_by(|a, b| a.affected.cmp(&b.affected));
        rules
    }

    /// Mark `domain` and its declared dependents stale without refetching.
    ///
    /// An undeclared domain is left untouched: a missing rule degrades to
    /// stale data, never to an error.
    pub fn invalidate(&self, domain: &KeyPrefix) -> InvalidationPlan {
        self.invalidate_except(domain, &[])
    }

    fn invalidate_except(&self, domain: &KeyPrefix, keep: &[CacheKey]) -> InvalidationPlan {
        let Some(rule) = self.rule(domain) else {
            warn!(domain = %domain, "No invalidation rule declared for domain, skipping");
            return InvalidationPlan {
                domain: domain.clone(),
                declared: false,
                invalidated: Vec::new(),
            };
        };

        let invalidated: BTreeSet<CacheKey> = rule
            .targets()
            .iter()
            .flat_map(|prefix| self.cache.invalidate_except(prefix, keep))
            .collect();

        InvalidationPlan {
            domain: domain.clone(),
            declared: true,
            invalidated: invalidated.into_iter().collect(),
        }
    }

    /// Invalidate `domain` and its dependents, then refetch every affected
    /// entry that is currently observed.
    pub async fn apply(&self, domain: &KeyPrefix) -> InvalidationReport {
        self.apply_except(domain, &[]).await
    }

    /// Like [`apply`](Self::apply), leaving the keys in `keep` fresh and
    /// unfetched. Used after a commit whose own value is already
    /// authoritative.
    pub async fn apply_except(&self, domain: &KeyPrefix, keep: &[CacheKey]) -> InvalidationReport {
        let plan = self.invalidate_except(domain, keep);
        let outcomes = join_all(
            plan.invalidated
                .iter()
                .map(|key| async move { (key.clone(), self.cache.refetch_if_active(key).await) }),
        )
        .await;

        let mut report = InvalidationReport {
            invalidated: plan.invalidated,
            ..Default::default()
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(RefetchOutcome::Refetched(_)) => report.refetched.push(key),
                Ok(RefetchOutcome::Deferred) => report.deferred.push(key),
                Ok(RefetchOutcome::Superseded) => report.superseded.push(key),
                // Removed between invalidation and refetch; nothing to refresh.
                Err(CacheError::Missing { .. }) => {}
                Err(err) => report.failed.push((key, err)),
            }
        }

        debug!(
            domain = %domain,
            invalidated = report.invalidated.len(),
            refetched = report.refetched.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "Applied invalidation"
        );
        report
    }

    /// Like [`apply`](Self::apply) but refetches run as background tasks.
    /// Returns the plan; refetches started are those of active entries.
    pub fn apply_detached(&self, domain: &KeyPrefix) -> InvalidationPlan {
        let plan = self.invalidate(domain);
        for key in &plan.invalidated {
            self.cache.spawn_refetch_if_active(key);
        }
        plan
    }

    /// List gaps in the rule table.
    pub fn audit(&self) -> Vec<InvalidationGap> {
        let declared: Vec<KeyPrefix> = self.rules.iter().map(|e| e.key().clone()).collect();
        let is_covered = |prefix: &KeyPrefix| declared.iter().any(|d| d.covers(prefix));

        let mut gaps = BTreeSet::new();
        for rule in self.rules() {
            for dependent in rule.dependents {
                if !is_covered(&dependent) {
                    gaps.insert(InvalidationGap::UndeclaredDependent {
                        affected: rule.affected.clone(),
                        dependent,
                    });
                }
            }
        }

        let cached_domains: BTreeSet<String> = self
            .cache
            .keys()
            .into_iter()
            .map(|key| key.domain().to_string())
            .collect();
        for domain in cached_domains {
            let domain = KeyPrefix::new(domain);
            if !self.is_declared(&domain) {
                gaps.insert(InvalidationGap::UndeclaredCachedDomain { domain });
            }
        }

        gaps.into_iter().collect()
    }

    /// Forget every rule.
    pub fn clear(&self) {
        self.rules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::QueryFetcher;
    use async_trait::async_trait;
    use fieldsync_core::RequestError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(AtomicU32);

    #[async_trait]
    impl QueryFetcher for Counting {
        async fn fetch(&self, key: &CacheKey) -> Result<Value, RequestError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"key": key.to_string(), "fetch": n}))
        }
    }

    fn prefix(raw: &str) -> KeyPrefix {
        KeyPrefix::parse(raw).unwrap()
    }

    fn material_graph() -> InvalidationGraph {
        let graph = InvalidationGraph::new(LocalCache::new());
        graph.declare(
            prefix("materials"),
            [prefix("materials.allocation-targets"), prefix("allocations")],
        );
        graph.declare(prefix("allocations"), []);
        graph
    }

    #[test]
    fn test_targets_dedupe() {
        let rule = InvalidationRule::new(prefix("a"), [prefix("b"), prefix("a"), prefix("b")]);
        assert_eq!(rule.targets(), vec![prefix("a"), prefix("b")]);
    }

    #[test]
    fn test_invalidate_covers_dependents() {
        let graph = material_graph();
        let cache = graph.cache();
        cache.set(CacheKey::detail("materials", "M1"), json!({}));
        cache.set(CacheKey::detail("allocations", "A1"), json!({}));
        cache.set(CacheKey::detail("projects", "P1"), json!({}));

        let plan = graph.invalidate(&prefix("materials"));

        assert!(plan.declared);
        assert_eq!(plan.invalidated.len(), 2);
        assert!(cache.get(&CacheKey::detail("allocations", "A1")).unwrap().is_stale());
        assert!(cache.get(&CacheKey::detail("projects", "P1")).unwrap().is_fresh());
    }

    #[test]
    fn test_undeclared_domain_is_noop() {
        let graph = material_graph();
        graph.cache().set(CacheKey::detail("crews", "C1"), json!({}));
        let plan = graph.invalidate(&prefix("crews"));
        assert!(!plan.declared);
        assert!(plan.invalidated.is_empty());
        assert!(graph
            .cache()
            .get(&CacheKey::detail("crews", "C1"))
            .unwrap()
            .is_fresh());
    }

    #[tokio::test]
    async fn test_apply_except_leaves_kept_key_alone() {
        let graph = material_graph();
        let cache = graph.cache().clone();
        let fetcher = Arc::new(Counting(AtomicU32::new(0)));
        let m1 = CacheKey::detail("materials", "M1");
        let _observed = cache.observe(m1.clone(), fetcher.clone()).await.unwrap();
        cache.set(m1.clone(), json!({"stock": 9}));

        let report = graph.apply_except(&prefix("materials"), &[m1.clone()]).await;

        assert!(!report.invalidated.contains(&m1));
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
        let read = cache.get(&m1).unwrap();
        assert!(read.is_fresh());
        assert_eq!(read.into_value(), json!({"stock": 9}));
    }

    #[tokio::test]
    async fn test_apply_refetches_only_active_entries() {
        let graph = material_graph();
        let cache = graph.cache().clone();
        let fetcher = Arc::new(Counting(AtomicU32::new(0)));

        let targets = CacheKey::new("materials").with("allocation-targets");
        let _active = cache.observe(targets.clone(), fetcher.clone()).await.unwrap();
        cache.set(CacheKey::detail("allocations", "A1"), json!({"qty": 1}));

        let report = graph.apply(&prefix("materials")).await;

        assert_eq!(report.refetched, vec![targets.clone()]);
        assert_eq!(report.deferred, vec![CacheKey::detail("allocations", "A1")]);
        assert!(report.is_clean());
        assert_eq!(cache.get(&targets).unwrap().into_value()["fetch"], 2);
        assert!(cache.get(&CacheKey::detail("allocations", "A1")).unwrap().is_stale());
    }

    #[test]
    fn test_audit_reports_uncovered_dependents_and_cached_domains() {
        let graph = material_graph();
        graph.declare(prefix("work-entries"), [prefix("projects")]);
        graph.cache().set(CacheKey::detail("crews", "C1"), json!({}));

        let gaps = graph.audit();

        assert!(gaps.contains(&InvalidationGap::UndeclaredDependent {
            affected: prefix("work-entries"),
            dependent: prefix("projects"),
        }));
        assert!(gaps.contains(&InvalidationGap::UndeclaredCachedDomain {
            domain: prefix("crews"),
        }));
        // Covered by the `materials` rule.
        assert!(!gaps.iter().any(|gap| matches!(
            gap,
            InvalidationGap::UndeclaredDependent { dependent, .. }
                if *dependent == prefix("materials.allocation-targets")
        )));
    }

    #[test]
    fn test_redeclare_replaces_dependents() {
        let graph = material_graph();
        graph.declare(prefix("materials"), [prefix("allocations")]);
        assert_eq!(
            graph.rule(&prefix("materials")).unwrap().dependents,
            vec![prefix("allocations")]
        );
    }
}
