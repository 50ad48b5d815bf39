//! Fail-open routing between the shared backend and the local backend.

use super::store::{LocalStore, StateStore};
use crate::clock::Timestamp;
use crate::error::StoreError;
use crate::state::{RateLimitState, StateKey, Versioned};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Routes each storage operation to the shared backend, every call bounded by
/// a timeout, and reruns it against the local backend when a call fails.
///
/// Availability wins over global accuracy: during an outage every instance
/// limits on its own local state. Recovery is automatic because the shared
/// backend is tried first on every call.
#[derive(Debug, Clone)]
pub struct FailoverStore {
    shared: Option<Arc<dyn StateStore>>,
    local: Arc<LocalStore>,
    degraded: Arc<AtomicBool>,
    fallbacks: Arc<AtomicU64>,
}

impl FailoverStore {
    /// Local backend only.
    pub fn local_only(local: LocalStore) -> Self {
        Self {
            shared: None,
            local: Arc::new(local),
            degraded: Arc::new(AtomicBool::new(false)),
            fallbacks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared backend with local fallback; `timeout` bounds every shared call.
    pub fn with_shared(shared: Arc<dyn StateStore>, local: LocalStore, timeout: Duration) -> Self {
        let shared: Arc<dyn StateStore> = Arc::new(Deadline { inner: shared, timeout });
        Self { shared: Some(shared), ..Self::local_only(local) }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn has_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// True while the last shared-backend call failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Operations served by the local backend because the shared one failed.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Run `op` against the shared backend, or the local one if a shared call fails.
    ///
    /// `op` must be self-contained (read, compute and write in one go) so a
    /// rerun on the local backend never mixes versions from two stores. The
    /// timeout applies to each backend call `op` makes, not to `op` as a
    /// whole: several slow but successful round trips are not an outage.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn StateStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if let Some(shared) = &self.shared {
            match op(shared.clone()).await {
                Ok(value) => {
                    self.mark_healthy();
                    return Ok(value);
                }
                Err(err) => self.mark_degraded(&err),
            }
        }
        let local: Arc<dyn StateStore> = self.local.clone();
        op(local).await
    }

    fn mark_degraded(&self, err: &StoreError) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                target: "abuseguard::failover",
                error = %err,
                "shared state backend failed; serving limits from local state"
            );
        } else {
            tracing::debug!(target: "abuseguard::failover", error = %err, "shared backend still failing");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(target: "abuseguard::failover", "shared state backend recovered");
        }
    }
}

/// Shared backend with a deadline on every call.
#[derive(Debug)]
struct Deadline {
    inner: Arc<dyn StateStore>,
    timeout: Duration,
}

impl Deadline {
    async fn bound<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout { after: self.timeout })?
    }
}

#[async_trait]
impl StateStore for Deadline {
    async fn read(&self, key: &StateKey, now: Timestamp) -> Result<Option<Versioned>, StoreError> {
        self.bound(self.inner.read(key, now)).await
    }

    async fn compare_and_write(
        &self,
        key: &StateKey,
        expected: Option<u64>,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        self.bound(self.inner.compare_and_write(key, expected, state, ttl, now)).await
    }

    async fn write(
        &self,
        key: &StateKey,
        state: RateLimitState,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        self.bound(self.inner.write(key, state, ttl, now)).await
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        self.bound(self.inner.delete(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ActorId;

    #[derive(Debug)]
    struct Down;

    #[async_trait]
    impl StateStore for Down {
        async fn read(&self, _: &StateKey, _: Timestamp) -> Result<Option<Versioned>, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn compare_and_write(
            &self,
            _: &StateKey,
            _: Option<u64>,
            _: RateLimitState,
            _: Duration,
            _: Timestamp,
        ) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn write(
            &self,
            _: &StateKey,
            _: RateLimitState,
            _: Duration,
            _: Timestamp,
        ) -> Result<(), StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
        async fn delete(&self, _: &StateKey) -> Result<(), StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
    }

    #[derive(Debug)]
    struct Hangs;

    #[async_trait]
    impl StateStore for Hangs {
        async fn read(&self, _: &StateKey, _: Timestamp) -> Result<Option<Versioned>, StoreError> {
            std::future::pending().await
        }
        async fn compare_and_write(
            &self,
            _: &StateKey,
            _: Option<u64>,
            _: RateLimitState,
            _: Duration,
            _: Timestamp,
        ) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn write(
            &self,
            _: &StateKey,
            _: RateLimitState,
            _: Duration,
            _: Timestamp,
        ) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &StateKey) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    fn key() -> StateKey {
        StateKey::new(ActorId::from("U1"), "login")
    }

    #[tokio::test]
    async fn falls_back_when_shared_errors() {
        let local = LocalStore::new();
        let store = FailoverStore::with_shared(Arc::new(Down), local.clone(), Duration::from_millis(100));
        let state = RateLimitState::FixedWindow { window_start: 0.0, count: 1 };

        store
            .run(|s| {
                let state = state.clone();
                async move { s.write(&key(), state, Duration::from_secs(60), 0.0).await }
            })
            .await
            .unwrap();

        assert!(store.is_degraded());
        assert_eq!(store.fallback_count(), 1);
        assert_eq!(local.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_shared_hangs() {
        let store =
            FailoverStore::with_shared(Arc::new(Hangs), LocalStore::new(), Duration::from_millis(50));
        let read = store.run(|s| async move { s.read(&key(), 0.0).await }).await.unwrap();
        assert!(read.is_none());
        assert!(store.is_degraded());
    }

    /// Healthy backend with a fixed round trip.
    #[derive(Debug, Default)]
    struct Slow(LocalStore);

    #[async_trait]
    impl StateStore for Slow {
        async fn read(&self, key: &StateKey, now: Timestamp) -> Result<Option<Versioned>, StoreError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.read(key, now).await
        }
        async fn compare_and_write(
            &self,
            key: &StateKey,
            expected: Option<u64>,
            state: RateLimitState,
            ttl: Duration,
            now: Timestamp,
        ) -> Result<bool, StoreError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.compare_and_write(key, expected, state, ttl, now).await
        }
        async fn write(
            &self,
            key: &StateKey,
            state: RateLimitState,
            ttl: Duration,
            now: Timestamp,
        ) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.write(key, state, ttl, now).await
        }
        async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.delete(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_each_call_not_the_whole_operation() {
        let local = LocalStore::new();
        let store =
            FailoverStore::with_shared(Arc::new(Slow::default()), local.clone(), Duration::from_millis(50));

        // Five 30ms round trips: 150ms in total, each call well inside 50ms.
        let reads = store
            .run(|s| async move {
                let mut seen = 0;
                for _ in 0..5 {
                    seen += usize::from(s.read(&key(), 0.0).await?.is_some());
                }
                Ok::<_, StoreError>(seen)
            })
            .await
            .unwrap();

        assert_eq!(reads, 0);
        assert!(!store.is_degraded());
        assert_eq!(store.fallback_count(), 0);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn local_only_never_degrades() {
        let store = FailoverStore::local_only(LocalStore::new());
        store.run(|s| async move { s.read(&key(), 0.0).await }).await.unwrap();
        assert!(!store.is_degraded());
        assert!(!store.has_shared());
    }
}
