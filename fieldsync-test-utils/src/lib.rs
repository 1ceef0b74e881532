//! Fieldsync Test Utilities
//!
//! Shared test infrastructure for the fieldsync workspace:
//! - Mock transport with scriptable connect failures and frame injection
//! - Scripted fetchers and request closures
//! - Fixtures for the material/allocation scenarios
//! - Proptest generators for keys and wire frames
//! - Cache assertions

pub use fieldsync_cache::{CacheRead, InvalidationGraph, LocalCache, QueryFetcher};
pub use fieldsync_core::{
    kinds, ActorId, CacheKey, EngineConfig, Envelope, KeyPrefix, PresenceStatus, RequestError,
    TransportError,
};
pub use fieldsync_realtime::{Connection, Connector};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// Server side of one mock connection.
#[derive(Debug, Clone)]
pub struct MockLink {
    inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    outbound: Arc<Mutex<mpsc::Receiver<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockLink {
    /// Deliver a frame to the client.
    pub fn push(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(text) => self.push_text(text),
            Err(_) => false,
        }
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(Ok(text.into())).is_ok()
    }

    /// Close the channel from the server side.
    pub fn close(&self) {
        let _ = self.inbound.send(Err(TransportError::Closed));
    }

    /// Raw frames the client has sent so far.
    pub fn sent_text(&self) -> Vec<String> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(text) = outbound.try_recv() {
            sent.push(text);
        }
        sent.clone()
    }

    /// Frames the client has sent so far, decoded. Undecodable frames are skipped.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent_text()
            .iter()
            .filter_map(|text| Envelope::decode(text).ok())
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent().into_iter().map(|e| e.kind).collect()
    }
}

#[derive(Debug, Default)]
struct MockState {
    fail_next: u32,
    always_fail: bool,
    endpoints: Vec<String>,
    links: Vec<MockLink>,
}

/// In-memory [`Connector`].
///
/// Every successful connect produces a [`MockLink`] through which a test
/// injects inbound frames and inspects outbound ones.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    attempts: Arc<AtomicU32>,
    connected: Arc<Notify>,
    outbound_buffer: usize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            attempts: Arc::new(AtomicU32::new(0)),
            connected: Arc::new(Notify::new()),
            outbound_buffer: 64,
        }
    }

    /// Refuse the next `n` connects.
    pub fn failing_first(n: u32) -> Self {
        let connector = Self::new();
        connector.fail_next(n);
        connector
    }

    pub fn always_failing() -> Self {
        let connector = Self::new();
        connector.set_always_fail(true);
        connector
    }

    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.lock().always_fail = fail;
    }

    /// Connect calls so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.lock().endpoints.clone()
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn link(&self, index: usize) -> Option<MockLink> {
        self.lock().links.get(index).cloned()
    }

    pub fn last_link(&self) -> Option<MockLink> {
        self.lock().links.last().cloned()
    }

    /// Wait until at least `count` connects have succeeded.
    pub async fn wait_for_links(&self, count: usize) -> MockLink {
        loop {
            let notified = self.connected.notified();
            {
                let state = self.lock();
                if state.links.len() >= count {
                    if let Some(link) = state.links.get(count - 1) {
                        return link.clone();
                    }
                }
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.endpoints.push(endpoint.to_string());
        if state.always_fail || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Err(TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "refused by mock".to_string(),
            });
        }

        let (outbound, outbound_rx) = mpsc::channel(self.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        state.links.push(MockLink {
            inbound: inbound_tx,
            outbound: Arc::new(Mutex::new(outbound_rx)),
            sent: Arc::new(Mutex::new(Vec::new())),
        });
        drop(state);
        self.connected.notify_waiters();

        let inbound = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(Connection { outbound, inbound })
    }
}

// ============================================================================
// SCRIPTED FETCHERS AND REQUESTS
// ============================================================================

/// [`QueryFetcher`] that plays back scripted results, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<Value, RequestError>>>,
    fallback: Mutex<Result<Value, RequestError>>,
    delay: Option<Duration>,
    gate: Option<Semaphore>,
    calls: AtomicU32,
}

impl ScriptedFetcher {
    pub fn returning(value: Value) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(value)),
            delay: None,
            gate: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: RequestError) -> Self {
        Self {
            fallback: Mutex::new(Err(error)),
            ..Self::returning(Value::Null)
        }
    }

    /// Sleep before answering. Pair with paused time to order fetches.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold every fetch until [`release`](Self::release) lets it through.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Let `n` held fetches complete.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Answer the next fetch with `result` before falling back.
    pub fn then(self, result: Result<Value, RequestError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
        self
    }

    /// Replace the fallback answer, e.g. once the server has changed.
    pub fn set(&self, value: Value) {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = Ok(value);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl QueryFetcher for ScriptedFetcher {
    async fn fetch(&self, _key: &CacheKey) -> Result<Value, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let result = match scripted {
            Some(result) => result,
            None => self
                .fallback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

/// Mutation request stand-in: answers each attempt from a script and counts
/// attempts. The last scripted result repeats once the script runs out.
#[derive(Debug, Clone)]
pub struct ScriptedRequest {
    script: Arc<Mutex<VecDeque<Result<Value, RequestError>>>>,
    last: Arc<Mutex<Option<Result<Value, RequestError>>>>,
    attempts: Arc<AtomicU32>,
}

impl ScriptedRequest {
    pub fn new(script: impl IntoIterator<Item = Result<Value, RequestError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            last: Arc::new(Mutex::new(None)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn ok(value: Value) -> Self {
        Self::new([Ok(value)])
    }

    pub fn err(error: RequestError) -> Self {
        Self::new([Err(error)])
    }

    /// One attempt. Use as `|| request.call()`.
    pub fn call(&self) -> futures_util::future::Ready<Result<Value, RequestError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match next {
            Some(result) => {
                *last = Some(result.clone());
                result
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(RequestError::Rejected("empty script".to_string()))),
        };
        futures_util::future::ready(result)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fieldsync_core::{RealtimeEvent, RealtimeEventType};
    use proptest::prelude::*;
    use serde_json::json;

    /// Generate a domain name from the field-operations vocabulary.
    pub fn arb_domain() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("materials".to_string()),
            Just("allocations".to_string()),
            Just("material-orders".to_string()),
            Just("projects".to_string()),
            Just("work-entries".to_string()),
            Just("crews".to_string()),
            Just("notifications".to_string()),
        ]
    }

    pub fn arb_entity_id() -> impl Strategy<Value = String> {
        "[A-Z][0-9]{1,4}".prop_map(|s| s)
    }

    /// Generate a detail key or a qualified view key.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        prop_oneof![
            (arb_domain(), arb_entity_id()).prop_map(|(d, id)| CacheKey::detail(d, id)),
            (arb_domain(), "[a-z-]{3,12}").prop_map(|(d, q)| CacheKey::new(d).with(q)),
            arb_domain().prop_map(|d| CacheKey::list(d, &json!({}))),
        ]
    }

    pub fn arb_key_prefix() -> impl Strategy<Value = KeyPrefix> {
        prop_oneof![
            arb_domain().prop_map(KeyPrefix::new),
            (arb_domain(), "[a-z-]{3,12}").prop_map(|(d, q)| KeyPrefix::new(d).with(q)),
        ]
    }

    /// Generate a small JSON object standing in for an entity.
    pub fn arb_entity_value() -> impl Strategy<Value = Value> {
        (arb_entity_id(), 0i64..1000, "[a-z]{1,8}")
            .prop_map(|(id, stock, unit)| json!({"id": id, "stock": stock, "unit": unit}))
    }

    pub fn arb_presence_status() -> impl Strategy<Value = PresenceStatus> {
        prop_oneof![
            Just(PresenceStatus::Online),
            Just(PresenceStatus::Away),
            Just(PresenceStatus::Offline),
        ]
    }

    pub fn arb_realtime_event_type() -> impl Strategy<Value = RealtimeEventType> {
        prop_oneof![
            Just(RealtimeEventType::EntityCreated),
            Just(RealtimeEventType::EntityUpdated),
            Just(RealtimeEventType::EntityDeleted),
            Just(RealtimeEventType::StatusChanged),
            Just(RealtimeEventType::AssignmentChanged),
            Just(RealtimeEventType::ProgressUpdated),
        ]
    }

    pub fn arb_realtime_event() -> impl Strategy<Value = RealtimeEvent> {
        (
            arb_realtime_event_type(),
            prop_oneof![
                Just("material".to_string()),
                Just("project".to_string()),
                Just("work_entry".to_string()),
                Just("crew".to_string()),
            ],
            prop::option::of(arb_entity_id()),
            0i64..2_000_000_000,
        )
            .prop_map(|(event_type, entity_type, entity_id, secs)| RealtimeEvent {
                event_type,
                entity_type,
                entity_id,
                data: json!({}),
                user_id: None,
                project_id: None,
                timestamp: Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now),
            })
    }

    /// Generate an envelope of an arbitrary kind with a scalar payload.
    pub fn arb_envelope() -> impl Strategy<Value = Envelope> {
        (
            prop_oneof![
                Just(kinds::HEARTBEAT.to_string()),
                Just(kinds::TYPING_INDICATOR.to_string()),
                "[a-z_]{1,16}".prop_map(|s| s),
            ],
            prop_oneof![
                Just(Value::Null),
                any::<i64>().prop_map(Value::from),
                "[a-zA-Z0-9 ]{0,24}".prop_map(Value::from),
            ],
        )
            .prop_map(|(kind, data)| Envelope::new(kind, data))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use fieldsync_core::{
        NotificationPriority, PresenceConfig, RealtimeEventType, ReconnectConfig, RetryConfig,
    };
    use serde_json::json;

    /// Config with millisecond delays so timing tests run quickly.
    pub fn fast_config() -> EngineConfig {
        EngineConfig {
            ws_base_url: "ws://test.local".to_string(),
            outbound_buffer: 64,
            reconnect: ReconnectConfig {
                max_attempts: 3,
                initial_ms: 10,
                max_ms: 10,
                multiplier: 1.0,
                jitter_ms: 0,
            },
            presence: PresenceConfig {
                base_ms: 10,
                cap_ms: 320,
                max_attempts: 5,
            },
            retry: RetryConfig {
                max_retries: 3,
                initial_ms: 1,
                max_ms: 8,
            },
        }
    }

    pub fn actor() -> ActorId {
        ActorId::new("user-1")
    }

    pub fn material(id: &str, stock: i64) -> Value {
        json!({"id": id, "name": format!("Material {id}"), "stock": stock, "unit": "m"})
    }

    pub fn material_key(id: &str) -> CacheKey {
        CacheKey::detail("materials", id)
    }

    pub fn allocation_targets_key() -> CacheKey {
        CacheKey::new("materials").with("allocation-targets")
    }

    /// A list payload in the `{ items: [...] }` shape.
    pub fn list_of(items: impl IntoIterator<Item = Value>) -> Value {
        json!({"items": items.into_iter().collect::<Vec<_>>()})
    }

    pub fn realtime_update(
        event_type: RealtimeEventType,
        entity_type: &str,
        entity_id: &str,
        data: Value,
    ) -> Envelope {
        Envelope::new(
            kinds::REALTIME_UPDATE,
            json!({
                "type": event_type,
                "entity_type": entity_type,
                "entity_id": entity_id,
                "data": data,
            }),
        )
    }

    pub fn notification(id: &str, priority: NotificationPriority) -> Envelope {
        Envelope::new(
            kinds::NOTIFICATION,
            json!({
                "id": id,
                "type": "assignment",
                "title": format!("Notification {id}"),
                "body": "",
                "priority": priority,
            }),
        )
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert the entry holds exactly `expected`.
    pub fn assert_cached(cache: &LocalCache, key: &CacheKey, expected: &Value) {
        let read = cache
            .get(key)
            .unwrap_or_else(|| panic!("expected {key} to be cached"));
        assert_eq!(read.value(), expected, "unexpected value at {key}");
    }

    pub fn assert_absent(cache: &LocalCache, key: &CacheKey) {
        assert!(!cache.contains(key), "expected {key} to be absent");
    }

    pub fn assert_stale(cache: &LocalCache, key: &CacheKey) {
        let read = cache
            .get(key)
            .unwrap_or_else(|| panic!("expected {key} to be cached"));
        assert!(read.is_stale(), "expected {key} to be stale");
    }

    pub fn assert_fresh(cache: &LocalCache, key: &CacheKey) {
        let read = cache
            .get(key)
            .unwrap_or_else(|| panic!("expected {key} to be cached"));
        assert!(read.is_fresh(), "expected {key} to be fresh");
    }
}
