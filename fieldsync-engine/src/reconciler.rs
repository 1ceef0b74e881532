//! Applies changes made by other actors.
//!
//! `realtime_update` and `notification` frames are queued by router handlers
//! and processed in arrival order by one worker task, which drives the same
//! [`InvalidationGraph`] the mutation path uses.

use fieldsync_cache::{InvalidationGraph, InvalidationReport};
use fieldsync_core::{
    kinds, ActorId, CacheKey, ChangeClass, Envelope, KeyPrefix, Notification, NotificationPriority,
    ProtocolError, RealtimeEvent, SyncError, TransportError,
};
use fieldsync_realtime::{HandlerRef, MessageRouter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rules;

/// Map a wire entity type to its cache domain.
pub fn domain_for_entity(entity_type: &str) -> Option<&'static str> {
    let domain = match entity_type {
        "project" | "projects" => rules::PROJECTS,
        "work_entry" | "work-entries" => rules::WORK_ENTRIES,
        "material" | "materials" => rules::MATERIALS,
        "material_allocation" | "allocations" => rules::ALLOCATIONS,
        "material_order" | "material-orders" => rules::MATERIAL_ORDERS,
        "house" | "houses" => rules::HOUSES,
        "appointment" | "appointments" => rules::APPOINTMENTS,
        "crew" | "crews" => rules::CREWS,
        "notification" | "notifications" => rules::NOTIFICATIONS,
        _ => return None,
    };
    Some(domain)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    StatusChanged,
    Assigned,
    Notification(NotificationPriority),
}

/// A transient user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeAlert {
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
}

/// Receives alerts raised by inbound events.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: RealtimeAlert);
}

/// Logs alerts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, alert: RealtimeAlert) {
        info!(kind = ?alert.kind, title = %alert.title, message = %alert.message, "Realtime alert");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Applied {
        domain: KeyPrefix,
        report: InvalidationReport,
    },
    /// Unknown entity type or message kind.
    Ignored,
}

pub struct InboundEventReconciler {
    graph: InvalidationGraph,
    actor: ActorId,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for InboundEventReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundEventReconciler")
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl InboundEventReconciler {
    pub fn new(graph: InvalidationGraph, actor: ActorId, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            graph,
            actor,
            alerts,
        }
    }

    pub async fn reconcile(&self, envelope: &Envelope) -> Result<Reconciled, ProtocolError> {
        match envelope.kind.as_str() {
            kinds::REALTIME_UPDATE => {
                let event: RealtimeEvent = envelope.payload()?;
                Ok(self.on_realtime_update(event).await)
            }
            kinds::NOTIFICATION => {
                let notification: Notification = envelope.payload()?;
                Ok(self.on_notification(notification).await)
            }
            other => {
                debug!(kind = other, "Reconciler ignoring message kind");
                Ok(Reconciled::Ignored)
            }
        }
    }

    async fn on_realtime_update(&self, event: RealtimeEvent) -> Reconciled {
        let Some(domain) = domain_for_entity(&event.entity_type) else {
            warn!(entity_type = %event.entity_type, "Unknown entity type in realtime update, ignoring");
            return Reconciled::Ignored;
        };
        let cache = self.graph.cache();
        let prefix = KeyPrefix::new(domain);
        let detail = event
            .entity_id
            .as_deref()
            .map(|id| CacheKey::detail(domain, id));

        if let Some(key) = &detail {
            if event.event_type.is_deletion() {
                cache.remove(key);
            } else {
                cache.invalidate(&key.as_prefix());
            }
        }

        let report = self.graph.apply(&prefix).await;

        // Without a rule the detail key is still worth refreshing.
        if let Some(key) = &detail {
            if !event.event_type.is_deletion() && !self.graph.is_declared(&prefix) && cache.contains(key) {
                if let Err(err) = cache.refetch_if_active(key).await {
                    warn!(key = %key, error = %err, "Detail refetch failed");
                }
            }
        }

        match event.event_type.class() {
            ChangeClass::StatusChanged => {
                if let Some(status) = event.status() {
                    self.alerts.alert(RealtimeAlert {
                        kind: AlertKind::StatusChanged,
                        title: "Status Updated".to_string(),
                        message: format!("{} status changed to {}", event.entity_type, status),
                        entity_type: Some(event.entity_type.clone()),
                        entity_id: event.entity_id.clone(),
                    });
                }
            }
            ChangeClass::AssignmentChanged => {
                if event.assigned_to() == Some(self.actor.as_str()) {
                    self.alerts.alert(RealtimeAlert {
                        kind: AlertKind::Assigned,
                        title: "New Assignment".to_string(),
                        message: format!("You have been assigned to a {}", event.entity_type),
                        entity_type: Some(event.entity_type.clone()),
                        entity_id: event.entity_id.clone(),
                    });
                }
            }
            ChangeClass::EntityChanged => {}
        }

        debug!(
            domain,
            event = ?event.event_type,
            invalidated = report.invalidated.len(),
            "Reconciled realtime update"
        );
        Reconciled::Applied {
            domain: prefix,
            report,
        }
    }

    async fn on_notification(&self, notification: Notification) -> Reconciled {
        let prefix = KeyPrefix::new(rules::NOTIFICATIONS);
        let report = self.graph.apply(&prefix).await;

        match serde_json::to_value(&notification) {
            Ok(value) => {
                self.graph
                    .cache()
                    .set(CacheKey::detail(rules::NOTIFICATIONS, notification.id.as_str()), value);
            }
            Err(err) => warn!(id = %notification.id, error = %err, "Failed to cache notification"),
        }

        if notification.priority.is_alerting() {
            self.alerts.alert(RealtimeAlert {
                kind: AlertKind::Notification(notification.priority),
                title: notification.title.clone(),
                message: notification.body.clone(),
                entity_type: Some(rules::NOTIFICATIONS.to_string()),
                entity_id: Some(notification.id.clone()),
            });
        }

        Reconciled::Applied {
            domain: prefix,
            report,
        }
    }

    /// Subscribe to `router` and process inbound frames on a worker task.
    pub fn attach(self: &Arc<Self>, router: &MessageRouter) -> ReconcilerHandle {
        let (queue, mut frames) = mpsc::unbounded_channel::<Envelope>();
        let handlers = [kinds::REALTIME_UPDATE, kinds::NOTIFICATION]
            .into_iter()
            .map(|kind| {
                let queue = queue.clone();
                let handler = router.subscribe_fn(kind, move |envelope: &Envelope| {
                    queue
                        .send(envelope.clone())
                        .map_err(|_| SyncError::Transport(TransportError::Closed))
                });
                (kind, handler)
            })
            .collect();

        let reconciler = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(envelope) = frames.recv().await {
                if let Err(err) = reconciler.reconcile(&envelope).await {
                    warn!(kind = %envelope.kind, error = %err, "Dropping undecodable inbound event");
                }
            }
        });

        ReconcilerHandle {
            router: router.clone(),
            handlers,
            task,
        }
    }
}

/// Keeps a reconciler attached to a router. Dropping it detaches.
pub struct ReconcilerHandle {
    router: MessageRouter,
    handlers: Vec<(&'static str, HandlerRef)>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ReconcilerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerHandle")
            .field("kinds", &self.handlers.iter().map(|(k, _)| *k).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        for (kind, handler) in &self.handlers {
            self.router.unsubscribe(kind, handler);
        }
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_cache::{FnFetcher, LocalCache, QueryFetcher};
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<RealtimeAlert>>);

    impl AlertSink for CollectingSink {
        fn alert(&self, alert: RealtimeAlert) {
            self.0.lock().unwrap().push(alert);
        }
    }

    fn setup() -> (InboundEventReconciler, LocalCache, Arc<CollectingSink>) {
        let cache = LocalCache::new();
        let graph = InvalidationGraph::with_rules(cache.clone(), rules::default_rules());
        let sink = Arc::new(CollectingSink::default());
        let reconciler = InboundEventReconciler::new(graph, ActorId::new("u1"), sink.clone());
        (reconciler, cache, sink)
    }

    fn update(data: serde_json::Value) -> Envelope {
        Envelope::new(kinds::REALTIME_UPDATE, data)
    }

    fn echo_fetcher() -> Arc<dyn QueryFetcher> {
        Arc::new(FnFetcher::new(|key: CacheKey| {
            async move { Ok(json!({"fresh": key.to_string()})) }.boxed()
        }))
    }

    #[test]
    fn test_entity_aliases() {
        assert_eq!(domain_for_entity("material_allocation"), Some("allocations"));
        assert_eq!(domain_for_entity("work_entry"), Some("work-entries"));
        assert_eq!(domain_for_entity("spaceship"), None);
    }

    #[tokio::test]
    async fn test_entity_update_invalidates_domain_and_detail() {
        let (reconciler, cache, _) = setup();
        cache.set(CacheKey::detail("materials", "M1"), json!({"stock": 10}));
        cache.set(CacheKey::detail("allocations", "A1"), json!({}));

        let outcome = reconciler
            .reconcile(&update(json!({
                "type": "entity_updated",
                "entity_type": "material",
                "entity_id": "M1",
            })))
            .await
            .unwrap();

        assert!(matches!(outcome, Reconciled::Applied { .. }));
        assert!(cache.get(&CacheKey::detail("materials", "M1")).unwrap().is_stale());
        assert!(cache.get(&CacheKey::detail("allocations", "A1")).unwrap().is_stale());
    }

    #[tokio::test]
    async fn test_deletion_removes_detail() {
        let (reconciler, cache, _) = setup();
        cache.set(CacheKey::detail("materials", "M1"), json!({}));
        reconciler
            .reconcile(&update(json!({
                "type": "entity_deleted",
                "entity_type": "material",
                "entity_id": "M1",
            })))
            .await
            .unwrap();
        assert!(!cache.contains(&CacheKey::detail("materials", "M1")));
    }

    #[tokio::test]
    async fn test_undeclared_domain_still_refreshes_active_detail() {
        let (reconciler, cache, _) = setup();
        reconciler.graph.clear();
        let key = CacheKey::detail("crews", "C1");
        let _guard = cache.observe(key.clone(), echo_fetcher()).await.unwrap();
        cache.set(key.clone(), json!({"old": true}));

        reconciler
            .reconcile(&update(json!({
                "type": "entity_updated",
                "entity_type": "crew",
                "entity_id": "C1",
            })))
            .await
            .unwrap();

        let read = cache.get(&key).unwrap();
        assert!(read.is_fresh());
        assert_eq!(read.into_value(), json!({"fresh": "crews.detail.C1"}));
    }

    #[tokio::test]
    async fn test_unknown_entity_type_ignored() {
        let (reconciler, _, _) = setup();
        let outcome = reconciler
            .reconcile(&update(json!({"type": "entity_updated", "entity_type": "spaceship"})))
            .await
            .unwrap();
        assert_eq!(outcome, Reconciled::Ignored);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_protocol_error() {
        let (reconciler, _, _) = setup();
        let result = reconciler
            .reconcile(&update(json!({"type": "teleported"})))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_assignment_alert_only_for_local_actor() {
        let (reconciler, _, sink) = setup();
        for assignee in ["u2", "u1"] {
            reconciler
                .reconcile(&update(json!({
                    "type": "assignment_changed",
                    "entity_type": "appointment",
                    "entity_id": "AP1",
                    "data": {"assigned_to": assignee},
                })))
                .await
                .unwrap();
        }
        let alerts = sink.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Assigned);
    }

    #[tokio::test]
    async fn test_status_change_alerts() {
        let (reconciler, _, sink) = setup();
        reconciler
            .reconcile(&update(json!({
                "type": "status_changed",
                "entity_type": "project",
                "entity_id": "P1",
                "data": {"status": "active"},
            })))
            .await
            .unwrap();
        let alerts = sink.0.lock().unwrap();
        assert_eq!(alerts[0].message, "project status changed to active");
    }

    #[tokio::test]
    async fn test_notification_cached_and_urgent_alerted() {
        let (reconciler, cache, sink) = setup();
        for (id, priority) in [("N1", "normal"), ("N2", "urgent")] {
            reconciler
                .reconcile(&Envelope::new(
                    kinds::NOTIFICATION,
                    json!({
                        "id": id,
                        "type": "material_low",
                        "title": "Low stock",
                        "body": "Cable below threshold",
                        "priority": priority,
                    }),
                ))
                .await
                .unwrap();
        }
        assert!(cache.get(&CacheKey::detail("notifications", "N1")).unwrap().is_fresh());
        let alerts = sink.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Notification(NotificationPriority::Urgent));
    }

    #[tokio::test]
    async fn test_attached_reconciler_processes_dispatched_frames() {
        let (reconciler, cache, _) = setup();
        let reconciler = Arc::new(reconciler);
        let router = MessageRouter::new();
        cache.set(CacheKey::detail("projects", "P1"), json!({}));

        let handle = reconciler.attach(&router);
        router.dispatch(&update(json!({
            "type": "entity_updated",
            "entity_type": "project",
            "entity_id": "P1",
        })));
        for _ in 0..20 {
            if cache.get(&CacheKey::detail("projects", "P1")).unwrap().is_stale() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(cache.get(&CacheKey::detail("projects", "P1")).unwrap().is_stale());

        drop(handle);
        assert_eq!(router.handler_count(kinds::REALTIME_UPDATE), 0);
    }
}
