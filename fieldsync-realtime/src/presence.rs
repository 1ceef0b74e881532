//! Presence reporting.
//!
//! [`PresenceMachine`] is a pure state machine: it consumes
//! [`PresenceSignal`]s (visibility, lifecycle, connection outcomes) and
//! returns the [`PresenceAction`]s to perform. [`PresenceReporter`] drives
//! one machine against a [`TransportSession`] on a background task.

use fieldsync_core::{kinds, ActorId, PresenceConfig, PresenceStatus, UserStatus};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::presence_delay;
use crate::session::{ConnectionState, TransportSession};

const SIGN_OUT_GRACE: Duration = Duration::from_secs(2);

/// Whether realtime updates are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeHealth {
    Healthy,
    /// Reconnection kept failing. Requests over the request path still work.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    /// The session is (again) connected.
    Connected,
    /// A connect attempt issued by the reporter failed.
    ConnectFailed,
    /// The session is retrying on its own.
    SessionRetrying,
    /// The session gave up.
    ConnectionLost,
    /// A scheduled reconnect is due.
    RetryElapsed,
    Hidden,
    Visible,
    SignOut,
    Unload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Emit(PresenceStatus),
    Connect,
    ScheduleReconnect { attempt: u32, delay: Duration },
    Degraded,
    Recovered,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Up,
    /// The session's own reconnect loop is running.
    Retrying,
    Down,
}

#[derive(Debug, Clone)]
pub struct PresenceMachine {
    config: PresenceConfig,
    status: PresenceStatus,
    link: Link,
    signed_in: bool,
    visible: bool,
    attempt: u32,
    degraded: bool,
}

impl PresenceMachine {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            status: PresenceStatus::Offline,
            link: Link::Down,
            signed_in: true,
            visible: true,
            attempt: 0,
            degraded: false,
        }
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Failed reconnects since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn on(&mut self, signal: PresenceSignal) -> Vec<PresenceAction> {
        use PresenceAction::*;

        if !self.signed_in {
            return Vec::new();
        }

        match signal {
            PresenceSignal::Connected => {
                if self.link == Link::Up {
                    return Vec::new();
                }
                self.link = Link::Up;
                self.attempt = 0;
                let mut actions = Vec::new();
                if self.degraded {
                    self.degraded = false;
                    actions.push(Recovered);
                }
                self.status = if self.visible {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Away
                };
                actions.push(Emit(self.status));
                actions
            }
            PresenceSignal::SessionRetrying => {
                self.link = Link::Retrying;
                Vec::new()
            }
            PresenceSignal::ConnectionLost => {
                self.link = Link::Down;
                if self.degraded {
                    return Vec::new();
                }
                vec![self.schedule()]
            }
            PresenceSignal::ConnectFailed => {
                self.link = Link::Down;
                if self.degraded {
                    return Vec::new();
                }
                self.attempt += 1;
                if self.attempt >= self.config.max_attempts {
                    self.degraded = true;
                    vec![Degraded]
                } else {
                    vec![self.schedule()]
                }
            }
            PresenceSignal::RetryElapsed => {
                if self.link == Link::Down && !self.degraded {
                    vec![Connect]
                } else {
                    Vec::new()
                }
            }
            PresenceSignal::Hidden => {
                self.visible = false;
                if self.link == Link::Up && self.status == PresenceStatus::Online {
                    self.status = PresenceStatus::Away;
                    vec![Emit(PresenceStatus::Away)]
                } else {
                    Vec::new()
                }
            }
            PresenceSignal::Visible => {
                self.visible = true;
                match self.link {
                    Link::Up if self.status != PresenceStatus::Online => {
                        self.status = PresenceStatus::Online;
                        vec![Emit(PresenceStatus::Online)]
                    }
                    Link::Up | Link::Retrying => Vec::new(),
                    Link::Down => {
                        // A returning user gets a fresh set of attempts.
                        self.attempt = 0;
                        vec![Connect]
                    }
                }
            }
            PresenceSignal::SignOut | PresenceSignal::Unload => {
                let was_up = self.link == Link::Up;
                self.signed_in = false;
                self.status = PresenceStatus::Offline;
                self.link = Link::Down;
                let mut actions = Vec::new();
                if was_up {
                    actions.push(Emit(PresenceStatus::Offline));
                }
                actions.push(Disconnect);
                actions
            }
        }
    }

    fn schedule(&self) -> PresenceAction {
        PresenceAction::ScheduleReconnect {
            attempt: self.attempt,
            delay: presence_delay(&self.config, self.attempt),
        }
    }
}

/// Drives a [`PresenceMachine`] for one session.
pub struct PresenceReporter {
    signals: mpsc::UnboundedSender<PresenceSignal>,
    status: watch::Receiver<PresenceStatus>,
    health: watch::Receiver<RealtimeHealth>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for PresenceReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceReporter")
            .field("status", &*self.status.borrow())
            .field("health", &*self.health.borrow())
            .finish_non_exhaustive()
    }
}

impl PresenceReporter {
    /// Start reporting presence for `actor` over `session`. Must be called
    /// within a tokio runtime.
    pub fn spawn(session: TransportSession, actor: ActorId, config: PresenceConfig) -> Self {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PresenceStatus::Offline);
        let (health_tx, health) = watch::channel(RealtimeHealth::Healthy);
        let driver = Driver {
            machine: PresenceMachine::new(config),
            session,
            actor,
            status: status_tx,
            health: health_tx,
            retry_at: None,
        };
        let task = tokio::spawn(driver.run(signal_rx));
        Self {
            signals,
            status,
            health,
            task,
        }
    }

    /// Feed a visibility or lifecycle signal. Never blocks.
    pub fn signal(&self, signal: PresenceSignal) {
        if self.signals.send(signal).is_err() {
            debug!(?signal, "Presence reporter stopped, signal ignored");
        }
    }

    pub fn status(&self) -> PresenceStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PresenceStatus> {
        self.status.clone()
    }

    pub fn health(&self) -> RealtimeHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<RealtimeHealth> {
        self.health.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Report `offline`, close the session and wait (bounded) for the
    /// reporter to stop.
    pub async fn sign_out(mut self) {
        self.signal(PresenceSignal::SignOut);
        if tokio::time::timeout(SIGN_OUT_GRACE, &mut self.task).await.is_err() {
            warn!("Presence reporter did not stop in time, aborting");
        }
    }
}

impl Drop for PresenceReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver {
    machine: PresenceMachine,
    session: TransportSession,
    actor: ActorId,
    status: watch::Sender<PresenceStatus>,
    health: watch::Sender<RealtimeHealth>,
    retry_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<PresenceSignal>) {
        let mut states = self.session.subscribe_state();
        let initial = *states.borrow_and_update();
        if let Some(signal) = signal_for(initial) {
            if self.step(signal).await {
                return;
            }
        }

        loop {
            let signal = tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let state = *states.borrow_and_update();
                    match signal_for(state) {
                        Some(signal) => signal,
                        None => continue,
                    }
                }
                received = signals.recv() => match received {
                    Some(signal) => signal,
                    None => return,
                },
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    PresenceSignal::RetryElapsed
                }
            };
            if self.step(signal).await {
                return;
            }
        }
    }

    /// Apply one signal and everything it leads to. Returns `true` once the
    /// reporter is done.
    async fn step(&mut self, signal: PresenceSignal) -> bool {
        let mut pending = vec![signal];
        while let Some(signal) = pending.pop() {
            let before = self.machine.status();
            let actions = self.machine.on(signal);
            if self.machine.status() != before {
                info!(from = before.as_str(), to = self.machine.status().as_str(), "Presence changed");
                self.status.send_replace(self.machine.status());
            }
            for action in actions {
                match action {
                    PresenceAction::Emit(status) => self.emit(status),
                    PresenceAction::Connect => match self.session.connect(&self.actor).await {
                        Ok(()) => pending.push(PresenceSignal::Connected),
                        Err(err) => {
                            warn!(error = %err, "Presence reconnect failed");
                            pending.push(PresenceSignal::ConnectFailed);
                        }
                    },
                    PresenceAction::ScheduleReconnect { attempt, delay } => {
                        warn!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling presence reconnect");
                        self.retry_at = Some(Instant::now() + delay);
                    }
                    PresenceAction::Degraded => {
                        error!(attempts = self.machine.attempt(), "Realtime degraded, reconnect attempts exhausted");
                        self.retry_at = None;
                        self.health.send_replace(RealtimeHealth::Degraded);
                    }
                    PresenceAction::Recovered => {
                        info!("Realtime recovered");
                        self.health.send_replace(RealtimeHealth::Healthy);
                    }
                    PresenceAction::Disconnect => {
                        self.session.disconnect();
                        return true;
                    }
                }
            }
        }
        false
    }

    fn emit(&self, status: PresenceStatus) {
        let payload = UserStatus {
            status,
            timestamp: chrono::Utc::now(),
        };
        match serde_json::to_value(&payload) {
            Ok(data) => {
                self.session.send(kinds::USER_STATUS, data);
            }
            Err(err) => warn!(error = %err, "Failed to encode presence status"),
        }
    }
}

fn signal_for(state: ConnectionState) -> Option<PresenceSignal> {
    match state {
        ConnectionState::Connected => Some(PresenceSignal::Connected),
        ConnectionState::Reconnecting { .. } => Some(PresenceSignal::SessionRetrying),
        ConnectionState::Failed => Some(PresenceSignal::ConnectionLost),
        // Our own connect outcomes are fed directly.
        ConnectionState::Connecting | ConnectionState::Disconnected => None,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::PresenceAction::*;

    fn machine() -> PresenceMachine {
        PresenceMachine::new(PresenceConfig::default())
    }

    fn connected() -> PresenceMachine {
        let mut m = machine();
        m.on(PresenceSignal::Connected);
        m
    }

    #[test]
    fn test_offline_to_online_on_connect() {
        let mut m = machine();
        assert_eq!(m.status(), PresenceStatus::Offline);
        assert_eq!(m.on(PresenceSignal::Connected), vec![Emit(PresenceStatus::Online)]);
        assert_eq!(m.status(), PresenceStatus::Online);
    }

    #[test]
    fn test_hidden_then_visible() {
        let mut m = connected();
        assert_eq!(m.on(PresenceSignal::Hidden), vec![Emit(PresenceStatus::Away)]);
        assert_eq!(m.on(PresenceSignal::Hidden), vec![]);
        assert_eq!(m.on(PresenceSignal::Visible), vec![Emit(PresenceStatus::Online)]);
    }

    #[test]
    fn test_visible_after_drop_reconnects_before_online() {
        let mut m = connected();
        m.on(PresenceSignal::Hidden);
        m.on(PresenceSignal::ConnectionLost);
        assert_eq!(m.on(PresenceSignal::Visible), vec![Connect]);
        assert_eq!(m.status(), PresenceStatus::Away);
        assert_eq!(m.on(PresenceSignal::Connected), vec![Emit(PresenceStatus::Online)]);
    }

    #[test]
    fn test_connect_while_hidden_reports_away() {
        let mut m = machine();
        m.on(PresenceSignal::Hidden);
        assert_eq!(m.on(PresenceSignal::Connected), vec![Emit(PresenceStatus::Away)]);
    }

    #[test]
    fn test_backoff_schedule_then_degraded() {
        let mut m = connected();
        let mut delays = Vec::new();
        if let [ScheduleReconnect { delay, .. }] = m.on(PresenceSignal::ConnectionLost).as_slice() {
            delays.push(delay.as_millis() as u64);
        }
        loop {
            assert_eq!(m.on(PresenceSignal::RetryElapsed), vec![Connect]);
            let actions = m.on(PresenceSignal::ConnectFailed);
            match actions.as_slice() {
                [ScheduleReconnect { delay, .. }] => delays.push(delay.as_millis() as u64),
                [Degraded] => break,
                other => panic!("unexpected actions {other:?}"),
            }
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert!(m.is_degraded());
        assert_eq!(m.on(PresenceSignal::RetryElapsed), vec![]);

        // Degradation is not terminal: a returning user retries, and success
        // clears the signal.
        assert_eq!(m.on(PresenceSignal::Visible), vec![Connect]);
        assert_eq!(
            m.on(PresenceSignal::Connected),
            vec![Recovered, Emit(PresenceStatus::Online)]
        );
        assert!(!m.is_degraded());
    }

    #[test]
    fn test_session_retrying_suppresses_visible_connect() {
        let mut m = connected();
        m.on(PresenceSignal::SessionRetrying);
        assert_eq!(m.on(PresenceSignal::Visible), vec![]);
    }

    #[test]
    fn test_sign_out_from_anywhere_goes_offline_once() {
        let mut m = connected();
        assert_eq!(
            m.on(PresenceSignal::SignOut),
            vec![Emit(PresenceStatus::Offline), Disconnect]
        );
        assert_eq!(m.status(), PresenceStatus::Offline);
        assert_eq!(m.on(PresenceSignal::Unload), vec![]);
        assert_eq!(m.on(PresenceSignal::Connected), vec![]);
    }

    #[test]
    fn test_unload_while_down_skips_emit() {
        let mut m = connected();
        m.on(PresenceSignal::ConnectionLost);
        assert_eq!(m.on(PresenceSignal::Unload), vec![Disconnect]);
    }
}
