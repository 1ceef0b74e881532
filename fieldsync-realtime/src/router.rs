//! Typed publish/subscribe over one transport session.
//!
//! Handlers are registered per message kind and invoked synchronously in
//! registration order. A handler that fails, or panics, is logged and does
//! not stop its siblings. Messages of a kind nobody subscribed to are
//! dropped silently so that newer servers can add kinds freely.

use dashmap::DashMap;
use fieldsync_core::{Envelope, SyncError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Receives envelopes of the kinds it is subscribed to.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), SyncError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) -> Result<(), SyncError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), SyncError> {
        self(envelope)
    }
}

/// Shared handle to a registered handler. Unsubscribe with the same handle.
pub type HandlerRef = Arc<dyn MessageHandler>;

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: Arc<DashMap<String, Vec<HandlerRef>>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("kinds", &self.handlers.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: impl Into<String>, handler: HandlerRef) {
        self.handlers.entry(kind.into()).or_default().push(handler);
    }

    /// Wrap a closure and subscribe it; keep the returned handle to
    /// unsubscribe later.
    pub fn subscribe_fn<F>(&self, kind: impl Into<String>, f: F) -> HandlerRef
    where
        F: Fn(&Envelope) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        let handler: HandlerRef = Arc::new(f);
        self.subscribe(kind, handler.clone());
        handler
    }

    /// Remove one `(kind, handler)` registration. Registrations of the same
    /// handler under other kinds are left alone.
    pub fn unsubscribe(&self, kind: &str, handler: &HandlerRef) -> bool {
        let Some(mut handlers) = self.handlers.get_mut(kind) else {
            return false;
        };
        let Some(position) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        handlers.remove(position);
        let now_empty = handlers.is_empty();
        drop(handlers);
        if now_empty {
            self.handlers.remove_if(kind, |_, handlers| handlers.is_empty());
        }
        true
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.get(kind).map(|h| h.len()).unwrap_or(0)
    }

    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        // Clone out so handlers may (un)subscribe while being invoked.
        let handlers = match self.handlers.get(&envelope.kind) {
            Some(handlers) => handlers.clone(),
            None => {
                trace!(kind = %envelope.kind, "No handlers for message kind, dropping");
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(kind = %envelope.kind, error = %err, "Message handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(kind = %envelope.kind, "Message handler panicked");
                }
            }
        }
        report
    }

    /// Decode one inbound frame and dispatch it. Malformed frames are logged
    /// and dropped.
    pub fn dispatch_text(&self, text: &str) -> DispatchReport {
        match Envelope::decode(text) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(err) => {
                warn!(error = %err, "Dropping malformed inbound message");
                DispatchReport::default()
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
