//! Error types for the abuse prevention engine.
//!
//! Only misconfiguration and invalid input are hard errors. A request that hits
//! its limit is a normal [`Decision`](crate::Decision) with `allowed == false`.
use std::time::Duration;

/// Errors surfaced synchronously by [`RateLimiter`](crate::RateLimiter).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// `check()` was called for an action with no registered limit.
    #[error("no rate limit registered for action '{action}'")]
    UnknownAction {
        /// The action that was looked up.
        action: String,
    },
    /// The actor identifier was empty.
    #[error("actor identifier must not be empty")]
    InvalidActor,
    /// A limit configuration failed validation.
    #[error("invalid rate limit config for '{action}': {reason}")]
    InvalidConfig {
        /// Action the config was meant for.
        action: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl GuardError {
    /// True for `UnknownAction` and `InvalidConfig`.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownAction { .. } | Self::InvalidConfig { .. })
    }

    /// True for `InvalidActor`.
    pub fn is_invalid_actor(&self) -> bool {
        matches!(self, Self::InvalidActor)
    }
}

/// Errors produced by [`StateStore`](crate::rate_limit::StateStore) backends.
///
/// The facade never propagates these; a failing shared backend degrades to the
/// local backend for the affected call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("state backend unavailable: {reason}")]
    Unavailable {
        /// Backend-specific description.
        reason: String,
    },
    /// The backend did not answer within the configured bound.
    #[error("state backend timed out after {after:?}")]
    Timeout {
        /// The bound that was exceeded.
        after: Duration,
    },
    /// A stored value could not be decoded.
    #[error("corrupted state at '{key}': {reason}")]
    Corrupted {
        /// Store key holding the bad value.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable { reason: reason.into() }
    }
}

/// Errors from loading an [`EngineConfig`](crate::config::EngineConfig).
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] GuardError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_display_names_action() {
        let err = GuardError::UnknownAction { action: "pack_create".into() };
        let msg = err.to_string();
        assert!(msg.contains("pack_create"));
        assert!(err.is_configuration());
        assert!(!err.is_invalid_actor());
    }

    #[test]
    fn invalid_actor_predicates() {
        let err = GuardError::InvalidActor;
        assert!(err.is_invalid_actor());
        assert!(!err.is_configuration());
    }

    #[test]
    fn store_timeout_display() {
        let err = StoreError::Timeout { after: Duration::from_millis(100) };
        assert!(err.to_string().contains("100ms"));
        assert_eq!(
            StoreError::unavailable("refused"),
            StoreError::Unavailable { reason: "refused".into() }
        );
    }

    #[test]
    fn config_error_wraps_guard_error() {
        let err: ConfigError =
            GuardError::InvalidConfig { action: "a".into(), reason: "bad".into() }.into();
        assert!(err.to_string().contains("bad"));
    }
}
