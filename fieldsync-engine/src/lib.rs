//! Fieldsync Engine - keeps the local view of shared field data correct
//!
//! Local writes go through the [`MutationCoordinator`] (optimistic write,
//! snapshot, rollback); changes by other actors arrive over the realtime
//! channel and go through the [`InboundEventReconciler`]. Both end in the
//! same [`InvalidationGraph`](fieldsync_cache::InvalidationGraph) pass, so a
//! change has the same cache effect whoever made it.
//!
//! [`Engine`] wires the pieces together for one signed-in actor.

pub mod engine;
pub mod mutation;
pub mod reconciler;
pub mod rules;
pub mod telemetry;

pub use engine::{Engine, EngineBuilder};
pub use mutation::{retry_delay, Mutation, MutationCoordinator, Optimistic};
pub use reconciler::{
    domain_for_entity, AlertKind, AlertSink, InboundEventReconciler, LogAlertSink, RealtimeAlert,
    Reconciled, ReconcilerHandle,
};
pub use rules::default_rules;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
