//! etcd shared state backend for `abuseguard` (companion crate).
//! Bring your own `etcd_client::Client` (feature `client`); state is stored as
//! JSON under a prefix, expires through leases, and compare-and-write is an
//! etcd transaction on the key's mod revision.

/// Normalize a key prefix: trim whitespace and trailing slashes, reject empty
/// or control characters.
///
/// # Errors
/// Returns `Err` if the prefix is empty or contains control characters.
pub fn normalize_prefix(prefix: impl Into<String>) -> Result<String, String> {
    let p: String = prefix.into();
    let p = p.trim().trim_end_matches('/').to_string();
    if p.is_empty() {
        return Err("prefix cannot be empty".to_string());
    }
    if p.chars().any(|c| c.is_control()) {
        return Err("prefix cannot contain control characters".to_string());
    }
    Ok(p)
}

/// Store key for one limiter entry: `prefix/action/actor`.
///
/// `%` and `/` inside either segment are percent-encoded so every
/// (action, actor) pair maps to a distinct key.
pub fn state_key(prefix: &str, key: &abuseguard::StateKey) -> String {
    format!("{}/{}/{}", prefix, escape(&key.action), escape(key.actor.as_str()))
}

fn escape(segment: &str) -> std::borrow::Cow<'_, str> {
    if !segment.contains(['%', '/']) {
        return segment.into();
    }
    segment.replace('%', "%25").replace('/', "%2F").into()
}

/// Lease length for a TTL; etcd leases have whole-second granularity.
pub fn lease_secs(ttl: std::time::Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

#[cfg(feature = "client")]
mod store {
    use super::{lease_secs, normalize_prefix, state_key};
    use abuseguard::{RateLimitState, SharedBackendConfig, StateKey, StateStore, StoreError, Timestamp, Versioned};
    use async_trait::async_trait;
    use etcd_client::{Compare, CompareOp, ConnectOptions, PutOptions, Txn, TxnOp};
    use std::time::Duration;

    #[derive(Clone)]
    pub struct EtcdStateStore {
        prefix: String,
        client: etcd_client::Client,
    }

    impl std::fmt::Debug for EtcdStateStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EtcdStateStore")
                .field("prefix", &self.prefix)
                .field("client", &"<etcd_client::Client>")
                .finish()
        }
    }

    fn unavailable(e: etcd_client::Error) -> StoreError {
        StoreError::unavailable(e.to_string())
    }

    impl EtcdStateStore {
        /// Create a store using an existing etcd client.
        ///
        /// # Errors
        /// Returns `Err` if the prefix is empty or contains control characters.
        pub fn new(prefix: impl Into<String>, client: etcd_client::Client) -> Result<Self, String> {
            Ok(Self { prefix: normalize_prefix(prefix)?, client })
        }

        /// Connect using the engine's shared-backend settings.
        pub async fn connect(config: &SharedBackendConfig) -> Result<Self, StoreError> {
            let options = ConnectOptions::new()
                .with_connect_timeout(config.timeout())
                .with_timeout(config.timeout());
            let client = etcd_client::Client::connect([config.address.as_str()], Some(options))
                .await
                .map_err(unavailable)?;
            Self::new(config.key_prefix.clone(), client).map_err(StoreError::unavailable)
        }

        pub fn prefix(&self) -> &str {
            &self.prefix
        }

        fn put_options(&self, lease: i64) -> PutOptions {
            PutOptions::new().with_lease(lease)
        }

        async fn grant(&self, ttl: Duration) -> Result<i64, StoreError> {
            let mut client = self.client.clone();
            let lease = client.lease_grant(lease_secs(ttl), None).await.map_err(unavailable)?;
            Ok(lease.id())
        }

        fn encode(key: &str, state: &RateLimitState) -> Result<String, StoreError> {
            state.to_json().map_err(|e| StoreError::Corrupted {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }
    }

    #[async_trait]
    impl StateStore for EtcdStateStore {
        async fn read(&self, key: &StateKey, _now: Timestamp) -> Result<Option<Versioned>, StoreError> {
            let key = state_key(&self.prefix, key);
            let mut client = self.client.clone();
            let resp = client.get(key.as_str(), None).await.map_err(unavailable)?;
            let Some(kv) = resp.kvs().first() else {
                return Ok(None);
            };
            let state = RateLimitState::from_json(kv.value()).map_err(|e| StoreError::Corrupted {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            let version = u64::try_from(kv.mod_revision()).unwrap_or_default();
            Ok(Some(Versioned { state, version }))
        }

        async fn compare_and_write(
            &self,
            key: &StateKey,
            expected: Option<u64>,
            state: RateLimitState,
            ttl: Duration,
            _now: Timestamp,
        ) -> Result<bool, StoreError> {
            let key = state_key(&self.prefix, key);
            let value = Self::encode(&key, &state)?;
            let guard = match expected {
                Some(rev) => Compare::mod_revision(
                    key.as_str(),
                    CompareOp::Equal,
                    i64::try_from(rev).unwrap_or(i64::MAX),
                ),
                // Version 0 means the key does not exist (or its lease expired).
                None => Compare::version(key.as_str(), CompareOp::Equal, 0),
            };
            let lease = self.grant(ttl).await?;
            let txn = Txn::new()
                .when([guard])
                .and_then([TxnOp::put(key.as_str(), value, Some(self.put_options(lease)))]);
            let mut client = self.client.clone();
            let resp = client.txn(txn).await.map_err(unavailable)?;
            if !resp.succeeded() {
                tracing::trace!(target: "abuseguard::etcd", key = %key, "compare-and-write lost");
                // Best effort; an orphaned lease expires on its own.
                let _ = client.lease_revoke(lease).await;
            }
            Ok(resp.succeeded())
        }

        async fn write(
            &self,
            key: &StateKey,
            state: RateLimitState,
            ttl: Duration,
            _now: Timestamp,
        ) -> Result<(), StoreError> {
            let key = state_key(&self.prefix, key);
            let value = Self::encode(&key, &state)?;
            let lease = self.grant(ttl).await?;
            let mut client = self.client.clone();
            client
                .put(key.as_str(), value, Some(self.put_options(lease)))
                .await
                .map_err(unavailable)?;
            Ok(())
        }

        async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
            let key = state_key(&self.prefix, key);
            let mut client = self.client.clone();
            client.delete(key.as_str(), None).await.map_err(|e| {
                tracing::warn!(target: "abuseguard::etcd", key = %key, error = %e, "delete failed");
                unavailable(e)
            })?;
            Ok(())
        }
    }
}

#[cfg(feature = "client")]
pub use store::EtcdStateStore;
