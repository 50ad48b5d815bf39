//! Convenient re-exports for common abuseguard types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock, Timestamp},
    config::{EngineConfig, RateLimitConfig, Strategy},
    error::{GuardError, StoreError},
    rate_limit::{ActorStatus, Decision, LocalStore, RateLimiter, StateStore},
    state::{ActorId, RateLimitState, StateKey, Versioned},
    telemetry::{LogSink, MemorySink, NullSink, SecurityEvent, SecurityEventKind, SecuritySink},
};
