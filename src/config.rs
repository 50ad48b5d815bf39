//! Limit and engine configuration.
//!
//! A [`RateLimitConfig`] is validated once, when built or deserialized, and is
//! immutable afterwards. [`EngineConfig`] is the startup surface: the action
//! table plus global abuse constants and shared-backend connection settings.

use crate::error::{ConfigError, GuardError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ABUSE_THRESHOLD: f64 = 100.0;
pub const DEFAULT_VIOLATION_HISTORY_CAP: usize = 100;
pub const DEFAULT_PENALTY_CAP_EXPONENT: u32 = 5;
pub const DEFAULT_VIOLATION_LOOKBACK_SECS: u64 = 3600;
pub const DEFAULT_BASE_PENALTY: f64 = 10.0;
pub const DEFAULT_SINK_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 100;
/// Shared-backend timeouts are clamped into this range.
pub const BACKEND_TIMEOUT_RANGE_MS: (u64, u64) = (50, 200);
pub const DEFAULT_KEY_PREFIX: &str = "abuseguard";

/// Limiting algorithm for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Continuous refill; tolerates short bursts.
    TokenBucket,
    /// Trailing log of timestamps; no boundary-reset exploit.
    SlidingWindow,
    /// Counter reset on aligned window boundaries.
    FixedWindow,
    /// Constant outflow regardless of burst timing.
    LeakyBucket,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::TokenBucket => "token_bucket",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::FixedWindow => "fixed_window",
            Strategy::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// Validated, immutable limit for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig", into = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    action: String,
    max_requests: u32,
    window_seconds: u64,
    strategy: Strategy,
    penalty_multiplier: f64,
    adaptive: bool,
}

impl RateLimitConfig {
    /// Start building a config for `action`.
    ///
    /// # Examples
    /// ```
    /// use abuseguard::{RateLimitConfig, Strategy};
    /// let cfg = RateLimitConfig::builder("pack_create")
    ///     .max_requests(5)
    ///     .window_seconds(3600)
    ///     .strategy(Strategy::SlidingWindow)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(cfg.max_requests(), 5);
    /// ```
    pub fn builder(action: impl Into<String>) -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new(action)
    }

    /// Start a builder from this config, e.g. to derive a tightened variant.
    pub fn to_builder(&self) -> RateLimitConfigBuilder {
        RateLimitConfigBuilder { inner: self.clone() }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn penalty_multiplier(&self) -> f64 {
        self.penalty_multiplier
    }

    pub fn adaptive(&self) -> bool {
        self.adaptive
    }

    /// Limit after adaptive tightening for an actor with `score`.
    ///
    /// Non-adaptive configs always return `max_requests`. Adaptive configs
    /// shrink as `max / (1 + score / threshold)`, never below 1.
    pub fn effective_limit(&self, score: f64, threshold: f64) -> u32 {
        if !self.adaptive || score <= 0.0 || threshold <= 0.0 {
            return self.max_requests;
        }
        let scaled = f64::from(self.max_requests) / (1.0 + score / threshold);
        (scaled.floor() as u32).clamp(1, self.max_requests)
    }

    fn validate(&self) -> Result<(), GuardError> {
        let invalid = |reason: &str| GuardError::InvalidConfig {
            action: self.action.clone(),
            reason: reason.to_string(),
        };
        if self.action.trim().is_empty() {
            return Err(invalid("action must not be empty"));
        }
        if self.max_requests == 0 {
            return Err(invalid("max_requests must be > 0"));
        }
        if self.window_seconds == 0 {
            return Err(invalid("window_seconds must be > 0"));
        }
        if !self.penalty_multiplier.is_finite() || self.penalty_multiplier < 1.0 {
            return Err(invalid("penalty_multiplier must be finite and >= 1.0"));
        }
        Ok(())
    }
}

/// Builder for [`RateLimitConfig`].
#[derive(Debug, Clone)]
pub struct RateLimitConfigBuilder {
    inner: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    fn new(action: impl Into<String>) -> Self {
        Self {
            inner: RateLimitConfig {
                action: action.into(),
                max_requests: 10,
                window_seconds: 60,
                strategy: Strategy::SlidingWindow,
                penalty_multiplier: 1.0,
                adaptive: false,
            },
        }
    }

    pub fn max_requests(mut self, max: u32) -> Self {
        self.inner.max_requests = max;
        self
    }

    pub fn window_seconds(mut self, secs: u64) -> Self {
        self.inner.window_seconds = secs;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.inner.strategy = strategy;
        self
    }

    pub fn penalty_multiplier(mut self, multiplier: f64) -> Self {
        self.inner.penalty_multiplier = multiplier;
        self
    }

    pub fn adaptive(mut self, adaptive: bool) -> Self {
        self.inner.adaptive = adaptive;
        self
    }

    pub fn build(self) -> Result<RateLimitConfig, GuardError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[derive(Serialize, Deserialize)]
struct RawRateLimitConfig {
    action: String,
    max_requests: u32,
    window_seconds: u64,
    strategy: Strategy,
    #[serde(default = "default_penalty_multiplier")]
    penalty_multiplier: f64,
    #[serde(default)]
    adaptive: bool,
}

fn default_penalty_multiplier() -> f64 {
    1.0
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = GuardError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self, Self::Error> {
        let cfg = RateLimitConfig {
            action: raw.action,
            max_requests: raw.max_requests,
            window_seconds: raw.window_seconds,
            strategy: raw.strategy,
            penalty_multiplier: raw.penalty_multiplier,
            adaptive: raw.adaptive,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl From<RateLimitConfig> for RawRateLimitConfig {
    fn from(cfg: RateLimitConfig) -> Self {
        Self {
            action: cfg.action,
            max_requests: cfg.max_requests,
            window_seconds: cfg.window_seconds,
            strategy: cfg.strategy,
            penalty_multiplier: cfg.penalty_multiplier,
            adaptive: cfg.adaptive,
        }
    }
}

/// Connection settings for the shared state backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedBackendConfig {
    pub address: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl SharedBackendConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Per-call bound, clamped into [`BACKEND_TIMEOUT_RANGE_MS`].
    pub fn timeout(&self) -> Duration {
        let (lo, hi) = BACKEND_TIMEOUT_RANGE_MS;
        Duration::from_millis(self.timeout_ms.clamp(lo, hi))
    }
}

fn default_backend_timeout_ms() -> u64 {
    DEFAULT_BACKEND_TIMEOUT_MS
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Startup configuration for the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Score above which an actor is blocked from every action.
    pub abuse_threshold: f64,
    /// Violation records retained per actor.
    pub violation_history_cap: usize,
    /// Cap on the exponent applied to `penalty_multiplier`.
    pub penalty_cap_exponent: u32,
    /// How far back violations count as "recent" for escalation.
    pub violation_lookback_secs: u64,
    /// Score added for a first violation.
    pub base_penalty: f64,
    /// Upper bound on a single sink emission.
    pub sink_timeout_ms: u64,
    pub shared_backend: Option<SharedBackendConfig>,
    pub limits: Vec<RateLimitConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            abuse_threshold: DEFAULT_ABUSE_THRESHOLD,
            violation_history_cap: DEFAULT_VIOLATION_HISTORY_CAP,
            penalty_cap_exponent: DEFAULT_PENALTY_CAP_EXPONENT,
            violation_lookback_secs: DEFAULT_VIOLATION_LOOKBACK_SECS,
            base_penalty: DEFAULT_BASE_PENALTY,
            sink_timeout_ms: DEFAULT_SINK_TIMEOUT_MS,
            shared_backend: None,
            limits: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Append a limit to the startup table.
    pub fn with_limit(mut self, limit: RateLimitConfig) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms.max(1))
    }

    pub fn lookback(&self) -> f64 {
        self.violation_lookback_secs as f64
    }

    /// Check global constants; limits are validated when they are built.
    pub fn validate(&self) -> Result<(), GuardError> {
        let invalid = |reason: &str| GuardError::InvalidConfig {
            action: "<engine>".to_string(),
            reason: reason.to_string(),
        };
        if !self.abuse_threshold.is_finite() || self.abuse_threshold <= 0.0 {
            return Err(invalid("abuse_threshold must be finite and > 0"));
        }
        if self.violation_history_cap == 0 {
            return Err(invalid("violation_history_cap must be > 0"));
        }
        if !self.base_penalty.is_finite() || self.base_penalty <= 0.0 {
            return Err(invalid("base_penalty must be finite and > 0"));
        }
        if let Some(backend) = &self.shared_backend {
            if backend.address.trim().is_empty() {
                return Err(invalid("shared_backend.address must not be empty"));
            }
        }
        Ok(())
    }
}
