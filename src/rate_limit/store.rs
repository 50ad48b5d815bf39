//! State storage contract and the in-process backend.

use crate::clock::{Clock, Timestamp};
use crate::error::StoreError;
use crate::state::{RateLimitState, StateKey, Versioned};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Key-value storage for limiter state with per-key expiry.
///
/// Implementations know nothing about limiting semantics. Atomicity of a
/// read-evaluate-write cycle comes from [`compare_and_write`](Self::compare_and_write):
/// the write only lands if the key still holds the version that was read.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Fetch the live state for `key`, or `None` if absent or expired at `now`.
    async fn read(&self, key: &StateKey, now: Timestamp) -> Result<Option<Versioned>, StoreError>;

    /// Write `state` if the key is still at `expected` (`None` = absent or expired).
    ///
    /// Returns `Ok(false)` when another writer got there first; the caller should re-read.
    async fn compare_and_write(
        &self,
        key: &StateKey,
        expected: Option<u64>,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Unconditional overwrite.
    async fn write(
        &self,
        key: &StateKey,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    state: RateLimitState,
    version: u64,
    expires_at: Timestamp,
}

impl Entry {
    fn live_at(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// In-process backend over a sharded concurrent map.
///
/// Expiry is lazy: an entry past its deadline reads as absent, and
/// [`sweep_expired`](Self::sweep_expired) reclaims the memory. Versions keep
/// increasing across expiry so a stale compare-and-write can never succeed
/// against a recreated key.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    entries: Arc<DashMap<StateKey, Entry>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Physically drop every entry expired at `now`; returns how many were removed.
    pub fn sweep_expired(&self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.live_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(target: "abuseguard::store", removed, "swept expired limiter state");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `every` on the current tokio runtime.
    ///
    /// The task stops when the returned handle is aborted.
    pub fn spawn_sweeper(
        &self,
        every: Duration,
        clock: Arc<dyn Clock>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep_expired(clock.now());
            }
        })
    }

    fn expiry(now: Timestamp, ttl: Duration) -> Timestamp {
        now + ttl.as_secs_f64()
    }
}

#[async_trait]
impl StateStore for LocalStore {
    async fn read(&self, key: &StateKey, now: Timestamp) -> Result<Option<Versioned>, StoreError> {
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .live_at(now)
                .then(|| Versioned { state: entry.state.clone(), version: entry.version })
        }))
    }

    async fn compare_and_write(
        &self,
        key: &StateKey,
        expected: Option<u64>,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        use dashmap::mapref::entry::Entry as Slot;

        let expires_at = Self::expiry(now, ttl);
        // The shard write lock is held for the whole check-and-set.
        match self.entries.entry(key.clone()) {
            Slot::Occupied(mut slot) => {
                let current = slot.get();
                let matches = match expected {
                    Some(v) => current.live_at(now) && current.version == v,
                    None => !current.live_at(now),
                };
                if !matches {
                    return Ok(false);
                }
                let version = current.version + 1;
                slot.insert(Entry { state, version, expires_at });
                Ok(true)
            }
            Slot::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                slot.insert(Entry { state, version: 1, expires_at });
                Ok(true)
            }
        }
    }

    async fn write(
        &self,
        key: &StateKey,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let expires_at = Self::expiry(now, ttl);
        self.entries
            .entry(key.clone())
            .and_modify(|entry| {
                entry.version += 1;
                entry.state = state.clone();
                entry.expires_at = expires_at;
            })
            .or_insert_with(|| Entry { state, version: 1, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
