//! Action → limit registry.
//!
//! Lookups vastly outnumber registrations, so the table is an immutable
//! snapshot behind an [`ArcSwap`]: readers load it without locking and
//! writers publish a modified copy.

use crate::config::RateLimitConfig;
use crate::error::GuardError;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

type Table = HashMap<String, Arc<RateLimitConfig>>;

/// Registry of per-action limits. Clones share the same table.
#[derive(Debug, Clone)]
pub struct RateLimitRegistry {
    table: Arc<ArcSwap<Table>>,
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self { table: Arc::new(ArcSwap::from_pointee(HashMap::new())) }
    }
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a startup table; later duplicates win.
    pub fn from_limits(limits: impl IntoIterator<Item = RateLimitConfig>) -> Self {
        let registry = Self::new();
        for limit in limits {
            registry.register(limit);
        }
        registry
    }

    /// Insert or replace the limit for `config.action()`.
    ///
    /// Last write wins. Replacing a limit does not reset state already stored
    /// for the action; state from a different strategy is discarded on the
    /// next check.
    pub fn register(&self, config: RateLimitConfig) {
        let config = Arc::new(config);
        let previous = self.table.rcu(|table| {
            let mut next = Table::clone(table);
            next.insert(config.action().to_string(), config.clone());
            next
        });
        if let Some(old) = previous.get(config.action()) {
            warn!(
                target: "abuseguard::registry",
                action = %config.action(),
                old_max = old.max_requests(),
                new_max = config.max_requests(),
                strategy = %config.strategy(),
                "rate limit replaced; last registration wins"
            );
        } else {
            info!(
                target: "abuseguard::registry",
                action = %config.action(),
                max_requests = config.max_requests(),
                window_seconds = config.window_seconds(),
                strategy = %config.strategy(),
                "rate limit registered"
            );
        }
    }

    /// Look up the limit for `action`; unregistered actions are a configuration error.
    pub fn lookup(&self, action: &str) -> Result<Arc<RateLimitConfig>, GuardError> {
        self.table
            .load()
            .get(action)
            .cloned()
            .ok_or_else(|| GuardError::UnknownAction { action: action.to_string() })
    }

    pub fn contains(&self, action: &str) -> bool {
        self.table.load().contains_key(action)
    }

    /// All registered limits sorted by action.
    pub fn snapshot(&self) -> Vec<Arc<RateLimitConfig>> {
        let mut all: Vec<_> = self.table.load().values().cloned().collect();
        all.sort_by(|a, b| a.action().cmp(b.action()));
        all
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}
