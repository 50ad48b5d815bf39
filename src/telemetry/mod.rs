//! Security events and the sinks that receive them.
//!
//! The limiter reports four kinds of event:
//!
//! - `rate_limit_violation`: a request was denied by its action's limit
//! - `abuse_score_escalated`: the violation cost more than the base penalty
//! - `actor_auto_blocked`: the actor's score crossed the threshold
//! - `blocked_actor_rejected`: a blocked actor tried again
//!
//! A sink is a `tower::Service<SecurityEvent>`, so sinks compose with
//! [`MulticastSink`] and [`FallbackSink`] and can be wrapped in any tower
//! middleware. The limiter hands events to an [`EventQueue`] drained by a
//! worker task, so a slow or failing sink never delays `check()`; failures
//! are logged and dropped.

pub mod events;
pub mod queue;
pub mod sinks;

pub use events::{SecurityEvent, SecurityEventKind};
pub use queue::{EventQueue, DEFAULT_EVENT_QUEUE_CAPACITY};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NullSink, SecuritySink, StreamingSink,
};
