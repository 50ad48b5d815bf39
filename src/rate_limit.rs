//! The rate limiter facade.
//!
//! [`RateLimiter`] is the only type callers talk to. A check runs:
//!
//! 1. actor validation and registry lookup (hard errors),
//! 2. the cross-action block short-circuit,
//! 3. read → evaluate → compare-and-write against the state store, retried on
//!    contention and rerun on the local backend if the shared one fails,
//! 4. on denial, a violation charged to the [`AbuseScorer`],
//! 5. security events queued for the sink; delivery happens off the request
//!    path, so the sink never adds latency to a check.
//!
//! Denials are ordinary [`Decision`]s. Only misconfiguration and invalid
//! input come back as [`GuardError`].

use crate::abuse::{AbuseScorer, ScorerConfig};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::{EngineConfig, RateLimitConfig, Strategy, DEFAULT_BACKEND_TIMEOUT_MS};
use crate::error::{GuardError, StoreError};
use crate::state::{ActorId, StateKey};
use crate::telemetry::{
    EventQueue, NullSink, SecurityEvent, SecurityEventKind, SecuritySink,
    DEFAULT_EVENT_QUEUE_CAPACITY,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod failover;
pub mod registry;
pub mod store;
pub mod strategies;

pub use failover::FailoverStore;
pub use registry::RateLimitRegistry;
pub use store::{LocalStore, StateStore};
pub use strategies::{Evaluation, Snapshot};

/// Compare-and-write attempts per check before giving up on a hot key.
const MAX_CAS_ATTEMPTS: u32 = 8;
const CAS_BACKOFF_BASE: Duration = Duration::from_micros(200);
const CAS_BACKOFF_MAX: Duration = Duration::from_millis(10);
/// Retry hint returned when contention exhausted the attempts.
const CONTENTION_RETRY_AFTER: f64 = 0.1;

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// When the window resets or the bucket is full again.
    pub reset_at: Timestamp,
    /// Seconds until the next attempt can succeed. `None` when allowed, and
    /// for blocked actors, who stay blocked until an administrative reset.
    pub retry_after: Option<f64>,
    pub abuse_score: f64,
    /// The actor is blocked from every action.
    pub blocked: bool,
    /// Limit applied to this request after adaptive tightening.
    pub limit: u32,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    fn blocked(score: f64, now: Timestamp) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at: now,
            retry_after: None,
            abuse_score: score,
            blocked: true,
            limit: 0,
        }
    }
}

/// Remaining capacity for one action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionStatus {
    pub remaining: u32,
    pub reset_at: Timestamp,
    pub limit: u32,
}

/// Read-only snapshot returned by [`RateLimiter::get_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActorStatus {
    pub actor: ActorId,
    pub score: f64,
    /// Violations retained in history.
    pub violation_count: usize,
    /// Violations inside the lookback period.
    pub recent_violations: usize,
    pub blocked: bool,
    /// Keyed by action, for every registered action.
    pub per_action: BTreeMap<String, ActionStatus>,
}

impl ActorStatus {
    pub fn remaining(&self, action: &str) -> Option<u32> {
        self.per_action.get(action).map(|s| s.remaining)
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder<S = NullSink> {
    config: EngineConfig,
    shared: Option<Arc<dyn StateStore>>,
    local: LocalStore,
    sink: S,
    event_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiterBuilder<NullSink> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            shared: None,
            local: LocalStore::new(),
            sink: NullSink,
            event_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }
}

impl<S> RateLimiterBuilder<S> {
    /// Replace the engine configuration, including its startup limit table.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add one limit to the startup table.
    pub fn limit(mut self, limit: RateLimitConfig) -> Self {
        self.config.limits.push(limit);
        self
    }

    pub fn limits(mut self, limits: impl IntoIterator<Item = RateLimitConfig>) -> Self {
        self.config.limits.extend(limits);
        self
    }

    /// Use a networked backend, with the local store as fail-open fallback.
    pub fn shared_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Supply the local backend, e.g. one with a sweeper already running.
    pub fn local_store(mut self, store: LocalStore) -> Self {
        self.local = store;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Security events buffered for the sink; further events are dropped.
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Route security events to `sink`.
    pub fn sink<T: SecuritySink>(self, sink: T) -> RateLimiterBuilder<T> {
        RateLimiterBuilder {
            config: self.config,
            shared: self.shared,
            local: self.local,
            sink,
            event_capacity: self.event_capacity,
            clock: self.clock,
        }
    }

    pub fn build(self) -> Result<RateLimiter<S>, GuardError> {
        self.config.validate()?;
        let timeout = self
            .config
            .shared_backend
            .as_ref()
            .map(|b| b.timeout())
            .unwrap_or(Duration::from_millis(DEFAULT_BACKEND_TIMEOUT_MS));
        let store = match self.shared {
            Some(shared) => FailoverStore::with_shared(shared, self.local, timeout),
            None => FailoverStore::local_only(self.local),
        };
        Ok(RateLimiter {
            registry: RateLimitRegistry::from_limits(self.config.limits.iter().cloned()),
            store,
            scorer: AbuseScorer::new(ScorerConfig::from(&self.config)),
            events: Arc::new(EventQueue::new(
                self.sink,
                self.event_capacity,
                self.config.sink_timeout(),
            )),
            clock: self.clock,
        })
    }
}

/// Decides, per (actor, action), whether an operation may proceed.
///
/// Cheap to clone; clones share registry, state and scores.
#[derive(Clone)]
pub struct RateLimiter<S = NullSink> {
    registry: RateLimitRegistry,
    store: FailoverStore,
    scorer: AbuseScorer,
    events: Arc<EventQueue<S>>,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.registry.len())
            .field("shared_backend", &self.store.has_shared())
            .field("degraded", &self.store.is_degraded())
            .field("events", &self.events)
            .finish()
    }
}

impl RateLimiter<NullSink> {
    pub fn builder() -> RateLimiterBuilder<NullSink> {
        RateLimiterBuilder::default()
    }

    /// Local backend, no sink, default constants.
    pub fn new(limits: impl IntoIterator<Item = RateLimitConfig>) -> Self {
        let config = EngineConfig::default();
        Self {
            registry: RateLimitRegistry::from_limits(limits),
            store: FailoverStore::local_only(LocalStore::new()),
            scorer: AbuseScorer::new(ScorerConfig::from(&config)),
            events: Arc::new(EventQueue::new(
                NullSink,
                DEFAULT_EVENT_QUEUE_CAPACITY,
                config.sink_timeout(),
            )),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<S> RateLimiter<S>
where
    S: SecuritySink,
    S::Future: Send + 'static,
    <S as tower::Service<SecurityEvent>>::Error: std::error::Error + Send + 'static,
{
    /// Decide whether `actor` may perform `action` at `now`.
    pub async fn check(
        &self,
        actor: impl Into<ActorId>,
        action: &str,
        now: Timestamp,
    ) -> Result<Decision, GuardError> {
        let actor = actor.into();
        actor.validate()?;
        let config = self.registry.lookup(action)?;

        if self.scorer.is_blocked(&actor) {
            let snap = self.scorer.snapshot(&actor, now);
            debug!(
                target: "abuseguard::limiter",
                actor = %actor,
                action,
                score = snap.score,
                "blocked actor rejected"
            );
            self.emit(SecurityEvent::new(
                SecurityEventKind::BlockedActorRejected,
                now,
                actor,
                action,
                snap.score,
                snap.recent_violations,
            ));
            return Ok(Decision::blocked(snap.score, now));
        }

        let score = self.scorer.score(&actor);
        let limit = config.effective_limit(score, self.scorer.config().threshold);
        let key = StateKey::new(actor.clone(), action);

        let Some(eval) = self.evaluate(&key, &config, limit, now).await else {
            warn!(
                target: "abuseguard::limiter",
                key = %key,
                attempts = MAX_CAS_ATTEMPTS,
                "state contention exhausted retries; denying"
            );
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset_at: now + CONTENTION_RETRY_AFTER,
                retry_after: Some(CONTENTION_RETRY_AFTER),
                abuse_score: score,
                blocked: false,
                limit,
            });
        };

        if eval.allowed {
            debug!(
                target: "abuseguard::limiter",
                actor = %actor,
                action,
                remaining = eval.remaining,
                limit,
                "allowed"
            );
            return Ok(Decision {
                allowed: true,
                remaining: eval.remaining,
                reset_at: eval.reset_at,
                retry_after: None,
                abuse_score: score,
                blocked: false,
                limit,
            });
        }

        let outcome =
            self.scorer.record_violation(&actor, action, config.penalty_multiplier(), now);
        debug!(
            target: "abuseguard::limiter",
            actor = %actor,
            action,
            retry_after = eval.retry_after,
            score = outcome.score,
            delta = outcome.score_delta,
            "denied"
        );

        let event = |kind| {
            SecurityEvent::new(
                kind,
                now,
                actor.clone(),
                action,
                outcome.score,
                outcome.recent_violations,
            )
        };
        self.emit(event(SecurityEventKind::RateLimitViolation));
        if outcome.escalated {
            self.emit(event(SecurityEventKind::AbuseScoreEscalated));
        }
        if outcome.newly_blocked {
            warn!(
                target: "abuseguard::limiter",
                actor = %actor,
                action,
                score = outcome.score,
                recent = outcome.recent_violations,
                "actor auto-blocked"
            );
            self.emit(event(SecurityEventKind::ActorAutoBlocked));
        }

        Ok(Decision {
            allowed: false,
            remaining: eval.remaining,
            reset_at: eval.reset_at,
            retry_after: if outcome.newly_blocked { None } else { eval.retry_after },
            abuse_score: outcome.score,
            blocked: outcome.newly_blocked,
            limit,
        })
    }

    /// [`check`](Self::check) at the configured clock's current time.
    pub async fn check_now(
        &self,
        actor: impl Into<ActorId>,
        action: &str,
    ) -> Result<Decision, GuardError> {
        self.check(actor, action, self.clock.now()).await
    }

    /// Read-only snapshot of an actor's score and per-action capacity.
    pub async fn get_status(
        &self,
        actor: impl Into<ActorId>,
        now: Timestamp,
    ) -> Result<ActorStatus, GuardError> {
        let actor = actor.into();
        actor.validate()?;
        let abuse = self.scorer.snapshot(&actor, now);
        let threshold = self.scorer.config().threshold;

        let mut per_action = BTreeMap::new();
        for config in self.registry.snapshot() {
            let key = StateKey::new(actor.clone(), config.action());
            let state = match self.store.run(|s| {
                let key = key.clone();
                async move { s.read(&key, now).await }
            })
            .await
            {
                Ok(v) => v.map(|v| v.state),
                Err(e) => {
                    warn!(target: "abuseguard::limiter", key = %key, error = %e, "status read failed");
                    None
                }
            };
            let limit = config.effective_limit(abuse.score, threshold);
            let snap = strategies::peek(
                config.strategy(),
                state.as_ref(),
                limit,
                config.window_seconds(),
                now,
            );
            per_action.insert(
                config.action().to_string(),
                ActionStatus { remaining: snap.remaining, reset_at: snap.reset_at, limit },
            );
        }

        Ok(ActorStatus {
            actor,
            score: abuse.score,
            violation_count: abuse.violation_count,
            recent_violations: abuse.recent_violations,
            blocked: abuse.state == crate::abuse::ActorState::Blocked,
            per_action,
        })
    }

    pub async fn get_status_now(&self, actor: impl Into<ActorId>) -> Result<ActorStatus, GuardError> {
        self.get_status(actor, self.clock.now()).await
    }

    /// Delete stored limiter state for one action, or every registered action
    /// when `action` is `None`. Abuse score is untouched.
    pub async fn reset_limits(
        &self,
        actor: impl Into<ActorId>,
        action: Option<&str>,
    ) -> Result<(), GuardError> {
        let actor = actor.into();
        actor.validate()?;
        let actions: Vec<String> = match action {
            Some(action) => vec![self.registry.lookup(action)?.action().to_string()],
            None => self.registry.snapshot().iter().map(|c| c.action().to_string()).collect(),
        };
        for action in &actions {
            let key = StateKey::new(actor.clone(), action.as_str());
            let result = self
                .store
                .run(|s| {
                    let key = key.clone();
                    async move { s.delete(&key).await }
                })
                .await;
            if let Err(e) = result {
                warn!(target: "abuseguard::limiter", key = %key, error = %e, "limit reset failed");
            }
            if self.store.has_shared() {
                // State written while degraded lives only in the local backend.
                if let Err(e) = self.store.local().delete(&key).await {
                    warn!(target: "abuseguard::limiter", key = %key, error = %e, "local limit reset failed");
                }
            }
        }
        info!(target: "abuseguard::admin", actor = %actor, actions = actions.len(), "limits reset");
        Ok(())
    }
}

impl<S> RateLimiter<S> {
    /// Upsert a limit; safe to call while checks are running.
    pub fn register_limit(&self, config: RateLimitConfig) {
        self.registry.register(config);
    }

    /// Clear the actor's score and history and lift any block.
    ///
    /// Returns `true` if the actor was blocked.
    pub fn reset_abuse_score(&self, actor: impl Into<ActorId>) -> Result<bool, GuardError> {
        let actor = actor.into();
        actor.validate()?;
        let was_blocked = self.scorer.reset(&actor);
        info!(target: "abuseguard::admin", actor = %actor, was_blocked, "abuse score reset");
        Ok(was_blocked)
    }

    pub fn is_blocked(&self, actor: impl Into<ActorId>) -> bool {
        self.scorer.is_blocked(&actor.into())
    }

    pub fn blocked_actors(&self) -> Vec<ActorId> {
        self.scorer.blocked_actors()
    }

    /// Security events dropped because the sink fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// True while the shared backend is failing and local state is in use.
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    pub fn registry(&self) -> &RateLimitRegistry {
        &self.registry
    }

    pub fn scorer(&self) -> &AbuseScorer {
        &self.scorer
    }

    pub fn local_store(&self) -> &LocalStore {
        self.store.local()
    }

    pub fn store(&self) -> &FailoverStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Read, evaluate and compare-and-write until the write lands.
    ///
    /// `None` means every attempt lost a race for the key.
    async fn evaluate(
        &self,
        key: &StateKey,
        config: &RateLimitConfig,
        limit: u32,
        now: Timestamp,
    ) -> Option<Evaluation> {
        let strategy = config.strategy();
        let window = config.window_seconds();
        let ttl = config.window();
        let result = self
            .store
            .run(|store| {
                let key = key.clone();
                async move { cas_cycle(store, &key, strategy, limit, window, ttl, now).await }
            })
            .await;
        match result {
            Ok(eval) => eval,
            Err(e) => {
                // Both backends failed; evaluate against fresh state without persisting.
                warn!(target: "abuseguard::limiter", key = %key, error = %e, "state unavailable; failing open");
                Some(strategies::evaluate(strategy, None, limit, window, now))
            }
        }
    }
}

impl<S> RateLimiter<S>
where
    S: SecuritySink,
    S::Future: Send + 'static,
    <S as tower::Service<SecurityEvent>>::Error: std::error::Error + Send + 'static,
{
    fn emit(&self, event: SecurityEvent) {
        self.events.push(event);
    }

    /// Wait until every security event emitted so far has reached the sink
    /// (or timed out there).
    pub async fn flush_events(&self) {
        self.events.flush().await;
    }
}

async fn cas_cycle(
    store: Arc<dyn StateStore>,
    key: &StateKey,
    strategy: Strategy,
    limit: u32,
    window: u64,
    ttl: Duration,
    now: Timestamp,
) -> Result<Option<Evaluation>, StoreError> {
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let current = store.read(key, now).await?;
        let eval = strategies::evaluate(
            strategy,
            current.as_ref().map(|v| &v.state),
            limit,
            window,
            now,
        );
        let expected = current.map(|v| v.version);
        if store.compare_and_write(key, expected, eval.state.clone(), ttl, now).await? {
            return Ok(Some(eval));
        }
        let delay = cas_backoff(attempt);
        debug!(target: "abuseguard::store", key = %key, attempt, "compare-and-write lost; retrying");
        tokio::time::sleep(delay).await;
    }
    Ok(None)
}

/// Full-jitter exponential backoff between compare-and-write attempts.
fn cas_backoff(attempt: u32) -> Duration {
    use rand::Rng;

    let ceiling = CAS_BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(CAS_BACKOFF_MAX);
    let micros = rand::rng().random_range(0..=ceiling.as_micros() as u64);
    Duration::from_micros(micros)
}
