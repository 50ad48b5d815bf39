#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # abuseguard
//!
//! Rate limiting and abuse prevention: per-(actor, action) limits, escalating
//! abuse scores and automatic cross-action blocking.
//!
//! ## Features
//!
//! - **Four strategies**: token bucket, sliding window, fixed window, leaky bucket
//! - **Abuse scoring** with escalating penalties and auto-block
//! - **Pluggable state** with a sharded in-process backend and fail-open
//!   routing around a shared backend
//! - **Security events** queued for `tower::Service` sinks off the request path
//! - **Runtime registration** of limits without pausing checks
//!
//! ## Quick Start
//!
//! ```rust
//! use abuseguard::{RateLimitConfig, RateLimiter, Strategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), abuseguard::GuardError> {
//!     let limiter = RateLimiter::new([RateLimitConfig::builder("pack_create")
//!         .max_requests(5)
//!         .window_seconds(3600)
//!         .strategy(Strategy::SlidingWindow)
//!         .build()?]);
//!
//!     let decision = limiter.check("U1", "pack_create", 0.0).await?;
//!     assert!(decision.allowed);
//!     assert_eq!(decision.remaining, 4);
//!     Ok(())
//! }
//! ```

pub mod abuse;
pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod state;
pub mod telemetry;

// Re-exports
pub use abuse::{AbuseScorer, ActorState, ScorerConfig, ViolationRecord};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{EngineConfig, RateLimitConfig, RateLimitConfigBuilder, SharedBackendConfig, Strategy};
pub use error::{ConfigError, GuardError, StoreError};
pub use rate_limit::{
    ActionStatus, ActorStatus, Decision, FailoverStore, LocalStore, RateLimitRegistry, RateLimiter,
    RateLimiterBuilder, StateStore,
};
pub use state::{ActorId, RateLimitState, StateKey, Versioned};
pub use telemetry::{SecurityEvent, SecurityEventKind, SecuritySink};
