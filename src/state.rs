//! Per-(actor, action) limiter state and the identifiers that key it.

use crate::clock::Timestamp;
use crate::error::GuardError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Opaque identifier of the entity being limited.
///
/// Built from strings or integers; validated (non-blank) by the facade before
/// any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject blank identifiers.
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.0.trim().is_empty() {
            Err(GuardError::InvalidActor)
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ActorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ActorId> for ActorId {
    fn from(id: &ActorId) -> Self {
        id.clone()
    }
}

macro_rules! actor_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for ActorId {
            fn from(n: $t) -> Self {
                Self(n.to_string())
            }
        })*
    };
}

actor_from_int!(u32, u64, i32, i64, usize);

/// Key of one limiter state entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub actor: ActorId,
    pub action: String,
}

impl StateKey {
    pub fn new(actor: ActorId, action: impl Into<String>) -> Self {
        Self { actor, action: action.into() }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.action, self.actor)
    }
}

/// Mutable limiter state; the variant matches the action's strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitState {
    TokenBucket {
        tokens: f64,
        last_refill: Timestamp,
    },
    SlidingWindow {
        /// Oldest first; at most `max_requests` entries.
        timestamps: VecDeque<Timestamp>,
    },
    FixedWindow {
        window_start: Timestamp,
        count: u32,
    },
    LeakyBucket {
        queue_level: f64,
        last_leak: Timestamp,
    },
}

impl RateLimitState {
    /// Encode for a networked backend.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// A state read together with the version used for compare-and-write.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub state: RateLimitState,
    pub version: u64,
}
