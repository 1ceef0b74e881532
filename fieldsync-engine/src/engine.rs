//! Engine lifecycle and the collaborator API.
//!
//! One [`Engine`] exists per signed-in actor. It owns every registry (cache,
//! rule table, router subscriptions) so nothing leaks between sessions:
//! [`Engine::teardown`] reports the actor offline, closes the channel and
//! empties all of them.

use fieldsync_cache::{
    CacheRead, InvalidationGraph, InvalidationReport, InvalidationRule, LocalCache, ObserverGuard,
    QueryFetcher, RefetchOutcome,
};
use fieldsync_core::{
    ActorId, CacheError, CacheKey, EngineConfig, Envelope, KeyPrefix, MutationError, RequestError,
    SyncError, SyncResult,
};
use fieldsync_realtime::{
    ConnectionState, Connector, HandlerRef, MessageRouter, PresenceReporter, PresenceSignal,
    RealtimeHealth, TransportSession, WsConnector,
};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::mutation::{Mutation, MutationCoordinator};
use crate::reconciler::{AlertSink, InboundEventReconciler, LogAlertSink, ReconcilerHandle};
use crate::rules::default_rules;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    actor: ActorId,
    auth_token: Option<String>,
    connector: Option<Arc<dyn Connector>>,
    rules: Option<Vec<InvalidationRule>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl EngineBuilder {
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Transport to use instead of WebSockets.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Rule table to use instead of the default field-operations rules.
    pub fn rules(mut self, rules: Vec<InvalidationRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Build the registries, connect, and start reporting presence.
    ///
    /// A failed connect does not fail init: business reads and writes do not
    /// need the realtime channel, and presence keeps retrying in the
    /// background.
    pub async fn init(self) -> SyncResult<Engine> {
        self.config.validate()?;

        let cache = LocalCache::new();
        let graph =
            InvalidationGraph::with_rules(cache.clone(), self.rules.unwrap_or_else(default_rules));
        let router = MessageRouter::new();
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(self.config.outbound_buffer)));
        let session = TransportSession::new(connector, router.clone(), self.config.clone());
        session.set_auth_token(self.auth_token);

        let coordinator = MutationCoordinator::new(graph.clone(), self.config.retry.clone());
        let reconciler = Arc::new(InboundEventReconciler::new(
            graph.clone(),
            self.actor.clone(),
            self.alerts.unwrap_or_else(|| Arc::new(LogAlertSink)),
        ));
        let reconciler_handle = reconciler.attach(&router);

        let connected = match session.connect(&self.actor).await {
            Ok(()) => true,
            Err(err) => {
                warn!(actor = %self.actor, error = %err, "Initial realtime connect failed");
                false
            }
        };
        let presence =
            PresenceReporter::spawn(session.clone(), self.actor.clone(), self.config.presence.clone());
        if !connected {
            presence.signal(PresenceSignal::ConnectFailed);
        }

        info!(actor = %self.actor, connected, "Engine initialized");
        Ok(Engine {
            config: self.config,
            actor: self.actor,
            cache,
            graph,
            router,
            session,
            coordinator,
            reconciler_handle: Mutex::new(Some(reconciler_handle)),
            presence: Mutex::new(Some(presence)),
        })
    }
}

/// The sync engine of one signed-in actor.
pub struct Engine {
    config: EngineConfig,
    actor: ActorId,
    cache: LocalCache,
    graph: InvalidationGraph,
    router: MessageRouter,
    session: TransportSession,
    coordinator: MutationCoordinator,
    reconciler_handle: Mutex<Option<ReconcilerHandle>>,
    presence: Mutex<Option<PresenceReporter>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("actor", &self.actor)
            .field("session", &self.session)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig, actor: ActorId) -> EngineBuilder {
        EngineBuilder {
            config,
            actor,
            auth_token: None,
            connector: None,
            rules: None,
            alerts: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn graph(&self) -> &InvalidationGraph {
        &self.graph
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    // ========================================================================
    // MESSAGING
    // ========================================================================

    pub fn subscribe<F>(&self, kind: &str, handler: F) -> HandlerRef
    where
        F: Fn(&Envelope) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        self.router.subscribe_fn(kind, handler)
    }

    pub fn unsubscribe(&self, kind: &str, handler: &HandlerRef) -> bool {
        self.router.unsubscribe(kind, handler)
    }

    /// Best-effort send over the realtime channel.
    pub fn send(&self, kind: &str, data: Value) -> bool {
        self.session.send(kind, data)
    }

    // ========================================================================
    // CACHE
    // ========================================================================

    pub fn get(&self, key: &CacheKey) -> Option<CacheRead<Value>> {
        self.cache.get(key)
    }

    pub async fn observe(
        &self,
        key: CacheKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> Result<ObserverGuard, CacheError> {
        self.cache.observe(key, fetcher).await
    }

    /// Invalidate a domain prefix. Declared domains go through their rule;
    /// any other prefix invalidates just its own keys. Observed entries are
    /// refetched either way.
    pub async fn invalidate(&self, prefix: &KeyPrefix) -> InvalidationReport {
        if self.graph.is_declared(prefix) {
            return self.graph.apply(prefix).await;
        }
        let mut report = InvalidationReport {
            invalidated: self.cache.invalidate(prefix),
            ..Default::default()
        };
        for key in report.invalidated.clone() {
            match self.cache.refetch_if_active(&key).await {
                Ok(RefetchOutcome::Refetched(_)) => report.refetched.push(key),
                Ok(RefetchOutcome::Deferred) => report.deferred.push(key),
                Ok(RefetchOutcome::Superseded) => report.superseded.push(key),
                Err(CacheError::Missing { .. }) => {}
                Err(err) => report.failed.push((key, err)),
            }
        }
        report
    }

    pub async fn mutate<F, Fut>(&self, mutation: Mutation, request: F) -> Result<Value, MutationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, RequestError>>,
    {
        self.coordinator.mutate(mutation, request).await
    }

    // ========================================================================
    // PRESENCE
    // ========================================================================

    /// Forward a page visibility or lifecycle signal.
    pub fn presence_signal(&self, signal: PresenceSignal) {
        if let Some(presence) = self.presence.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            presence.signal(signal);
        }
    }

    pub fn health(&self) -> RealtimeHealth {
        self.presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.health())
            .unwrap_or(RealtimeHealth::Degraded)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Sign out: report offline, close the channel, drop every subscription,
    /// rule and cached entry. Safe to call more than once.
    pub async fn teardown(&self) {
        let presence = self
            .presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(presence) = presence {
            presence.sign_out().await;
        }
        drop(
            self.reconciler_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.session.disconnect();
        self.cache.clear();
        self.graph.clear();
        info!(actor = %self.actor, "Engine torn down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.session.disconnect();
    }
}
