//! The transport session: one realtime channel per signed-in actor.
//!
//! `connect` opens the channel and authenticates before anything else is
//! sent. After that a supervisor task owns the channel: it feeds inbound
//! frames to the [`MessageRouter`] and, when the channel drops, reconnects
//! with backoff up to `reconnect.max_attempts` consecutive attempts. Running
//! out of attempts is terminal and published as [`ConnectionState::Failed`].

use fieldsync_core::{ActorId, EngineConfig, Envelope, ReconnectConfig, TransportError};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::reconnect_delay;
use crate::router::MessageRouter;
use crate::transport::{Connection, Connector};

/// Connection lifecycle as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted. Only a new `connect` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// The currently open channel. `generation` changes on every connect and
/// disconnect so a superseded supervisor cannot publish into a newer one.
struct Link {
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    supervisor: Option<JoinHandle<()>>,
}

struct SessionShared {
    connector: Arc<dyn Connector>,
    router: MessageRouter,
    config: EngineConfig,
    auth_token: RwLock<Option<String>>,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    released: AtomicBool,
}

impl SessionShared {
    fn link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a state on behalf of `generation`; ignored if superseded.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let link = self.link();
        if link.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Authenticate on a fresh channel, then make it the session's outbound
    /// channel. Nothing else can be sent before the auth frame.
    async fn install(&self, generation: u64, outbound: mpsc::Sender<String>) -> bool {
        if let Some(token) = self.auth_token() {
            match Envelope::auth(&token).encode() {
                Ok(frame) => {
                    if outbound.send(frame).await.is_err() {
                        warn!("Channel closed before auth could be sent");
                        return false;
                    }
                }
                Err(err) => warn!(error = %err, "Failed to encode auth message"),
            }
        }
        let mut link = self.link();
        if link.generation != generation {
            return false;
        }
        link.outbound = Some(outbound);
        self.state.send_replace(ConnectionState::Connected);
        true
    }

    fn drop_outbound(&self, generation: u64) {
        let mut link = self.link();
        if link.generation == generation {
            link.outbound = None;
        }
    }
}

/// Cloneable handle to one actor's session.
#[derive(Clone)]
pub struct TransportSession {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, router: MessageRouter, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(SessionShared {
                connector,
                router,
                config,
                auth_token: RwLock::new(None),
                link: Mutex::new(Link {
                    generation: 0,
                    outbound: None,
                    supervisor: None,
                }),
                state,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.shared.router
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self
            .shared
            .auth_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Open the channel for `actor`, authenticate, and start supervising it.
    ///
    /// Already connected sessions return immediately. A failure of this first
    /// attempt is returned to the caller and not retried here.
    pub async fn connect(&self, actor: &ActorId) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let generation = {
            let mut link = self.shared.link();
            link.generation += 1;
            link.outbound = None;
            if let Some(previous) = link.supervisor.take() {
                previous.abort();
            }
            self.shared.state.send_replace(ConnectionState::Connecting);
            link.generation
        };
        self.shared.released.store(false, Ordering::SeqCst);

        let endpoint = self.shared.config.endpoint_for(actor);
        info!(endpoint = %endpoint, actor = %actor, "Connecting realtime session");
        let connection = match self.shared.connector.connect(&endpoint).await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Realtime connect failed");
                self.shared.publish(generation, ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let Connection { outbound, inbound } = connection;
        if !self.shared.install(generation, outbound).await {
            return Err(TransportError::Closed);
        }
        info!(endpoint = %endpoint, "Realtime session connected");

        let task = tokio::spawn(supervise(self.shared.clone(), generation, endpoint, inbound));
        let mut link = self.shared.link();
        if link.generation == generation {
            link.supervisor = Some(task);
        } else {
            task.abort();
        }
        Ok(())
    }

    /// Send one message. Best effort: returns `false` and drops the message
    /// when the channel is not open or its buffer is full.
    pub fn send(&self, kind: &str, data: Value) -> bool {
        let Some(outbound) = self.shared.link().outbound.clone() else {
            debug!(kind, "Channel not open, dropping outbound message");
            return false;
        };
        let frame = match Envelope::new(kind, data).encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(kind, error = %err, "Failed to encode outbound message");
                return false;
            }
        };
        match outbound.try_send(frame) {
            Ok(()) => {
                trace!(kind, "Sent realtime message");
                true
            }
            Err(err) => {
                debug!(kind, error = %err, "Outbound message dropped");
                false
            }
        }
    }

    /// Close the channel and release the router's subscriptions. Calling it
    /// again is a no-op.
    pub fn disconnect(&self) {
        {
            let mut link = self.shared.link();
            link.generation += 1;
            link.outbound = None;
            if let Some(supervisor) = link.supervisor.take() {
                supervisor.abort();
            }
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
        if !self.shared.released.swap(true, Ordering::SeqCst) {
            self.shared.router.clear();
            info!("Realtime session disconnected");
        }
    }
}

async fn supervise(
    shared: Arc<SessionShared>,
    generation: u64,
    endpoint: String,
    mut inbound: BoxStream<'static, Result<String, TransportError>>,
) {
    let reconnect: ReconnectConfig = shared.config.reconnect.clone();
    loop {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(text) => {
                    shared.router.dispatch_text(&text);
                }
                Err(err) => {
                    debug!(error = %err, "Realtime channel error");
                    break;
                }
            }
        }
        shared.drop_outbound(generation);
        warn!(endpoint = %endpoint, "Realtime channel closed unexpectedly");

        let mut attempt = 0;
        inbound = loop {
            if attempt >= reconnect.max_attempts {
                error!(
                    endpoint = %endpoint,
                    attempts = attempt,
                    "Realtime reconnect attempts exhausted"
                );
                shared.publish(generation, ConnectionState::Failed);
                return;
            }
            attempt += 1;
            if !shared.publish(generation, ConnectionState::Reconnecting { attempt }) {
                return;
            }
            let delay = reconnect_delay(&reconnect, attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling realtime reconnect");
            tokio::time::sleep(delay).await;

            match shared.connector.connect(&endpoint).await {
                Ok(Connection { outbound, inbound }) => {
                    if !shared.install(generation, outbound).await {
                        return;
                    }
                    info!(attempt, "Realtime session reconnected");
                    break inbound;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Realtime reconnect failed");
                }
            }
        };
    }
}
