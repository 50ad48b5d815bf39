#![allow(dead_code)]

use abuseguard::{
    LocalStore, RateLimitConfig, RateLimitState, StateKey, StateStore, StoreError, Strategy,
    Timestamp, Versioned,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const STRATEGIES: [Strategy; 4] = [
    Strategy::TokenBucket,
    Strategy::SlidingWindow,
    Strategy::FixedWindow,
    Strategy::LeakyBucket,
];

pub fn limit(action: &str, max: u32, window: u64, strategy: Strategy) -> RateLimitConfig {
    RateLimitConfig::builder(action)
        .max_requests(max)
        .window_seconds(window)
        .strategy(strategy)
        .build()
        .expect("valid limit")
}

/// A "networked" store that can be switched off, standing in for a shared backend.
#[derive(Debug, Clone, Default)]
pub struct SwitchableStore {
    inner: LocalStore,
    down: Arc<AtomicBool>,
    hang: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    calls: Arc<AtomicU64>,
}

impl SwitchableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Round trip added to every call while the store stays healthy.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &LocalStore {
        &self.inner
    }

    async fn gate(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for SwitchableStore {
    async fn read(&self, key: &StateKey, now: Timestamp) -> Result<Option<Versioned>, StoreError> {
        self.gate().await?;
        self.inner.read(key, now).await
    }

    async fn compare_and_write(
        &self,
        key: &StateKey,
        expected: Option<u64>,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        self.gate().await?;
        self.inner.compare_and_write(key, expected, state, ttl, now).await
    }

    async fn write(
        &self,
        key: &StateKey,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        self.gate().await?;
        self.inner.write(key, state, ttl, now).await
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        self.gate().await?;
        self.inner.delete(key).await
    }
}
