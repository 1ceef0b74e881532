//! Fieldsync Realtime - push channel to the server
//!
//! One [`TransportSession`] per signed-in actor carries inbound change
//! notifications to a [`MessageRouter`], which fans them out to the handlers
//! subscribed per message kind. A [`PresenceReporter`] publishes the local
//! actor's status over the same session and takes over reconnection once
//! the session's own attempts run out.
//!
//! Business writes never travel over this channel; losing it degrades
//! freshness, not correctness.

pub mod backoff;
pub mod presence;
pub mod router;
pub mod session;
pub mod transport;

pub use backoff::{presence_delay, reconnect_delay};
pub use presence::{PresenceAction, PresenceMachine, PresenceReporter, PresenceSignal, RealtimeHealth};
pub use router::{DispatchReport, HandlerRef, MessageHandler, MessageRouter};
pub use session::{ConnectionState, TransportSession};
pub use transport::{Connection, Connector, WsConnector};
