//! Escalating abuse scores and automatic blocking.
//!
//! Each actor is in one of two states:
//!
//! - **Normal**: requests are evaluated per action.
//! - **Blocked**: entered when the score exceeds the threshold after a
//!   violation; every action is denied without evaluation.
//!
//! There is no automatic decay. Only [`AbuseScorer::reset`] returns an actor
//! to Normal.
//!
//! A violation adds `base * multiplier^min(recent, cap)` where `recent` counts
//! the actor's earlier violations, across all actions, inside the lookback
//! period. Repeat offenders therefore escalate quickly when the action's
//! multiplier is above 1.

use crate::clock::Timestamp;
use crate::config::{
    EngineConfig, DEFAULT_ABUSE_THRESHOLD, DEFAULT_BASE_PENALTY, DEFAULT_PENALTY_CAP_EXPONENT,
    DEFAULT_VIOLATION_HISTORY_CAP, DEFAULT_VIOLATION_LOOKBACK_SECS,
};
use crate::state::ActorId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// One denied request.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationRecord {
    pub timestamp: Timestamp,
    pub action: String,
    pub score_delta: f64,
}

/// Whether an actor may be evaluated at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActorState {
    #[default]
    Normal,
    Blocked,
}

#[derive(Debug, Default)]
struct ActorRecord {
    score: f64,
    history: VecDeque<ViolationRecord>,
    state: ActorState,
}

impl ActorRecord {
    fn recent(&self, since: Timestamp) -> usize {
        self.history.iter().rev().take_while(|v| v.timestamp >= since).count()
    }
}

/// Result of recording a violation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViolationOutcome {
    pub score_delta: f64,
    pub score: f64,
    /// Violations inside the lookback period, including this one.
    pub recent_violations: usize,
    /// The penalty multiplier raised this delta above the base penalty.
    pub escalated: bool,
    /// This violation moved the actor from Normal to Blocked.
    pub newly_blocked: bool,
}

/// Read-only view of an actor's abuse state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AbuseSnapshot {
    pub score: f64,
    /// Violations retained in history.
    pub violation_count: usize,
    pub recent_violations: usize,
    pub state: ActorState,
}

/// Scoring constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorerConfig {
    pub threshold: f64,
    pub history_cap: usize,
    pub cap_exponent: u32,
    pub lookback_secs: f64,
    pub base_penalty: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ABUSE_THRESHOLD,
            history_cap: DEFAULT_VIOLATION_HISTORY_CAP,
            cap_exponent: DEFAULT_PENALTY_CAP_EXPONENT,
            lookback_secs: DEFAULT_VIOLATION_LOOKBACK_SECS as f64,
            base_penalty: DEFAULT_BASE_PENALTY,
        }
    }
}

impl From<&EngineConfig> for ScorerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            threshold: cfg.abuse_threshold,
            history_cap: cfg.violation_history_cap.max(1),
            cap_exponent: cfg.penalty_cap_exponent,
            lookback_secs: cfg.lookback(),
            base_penalty: cfg.base_penalty,
        }
    }
}

/// Sole owner of abuse scores and violation histories.
///
/// Records live in a sharded map; every mutation of one actor happens under
/// that actor's entry guard, so same-actor updates serialize while different
/// actors proceed independently.
#[derive(Debug, Clone, Default)]
pub struct AbuseScorer {
    records: Arc<DashMap<ActorId, ActorRecord>>,
    config: ScorerConfig,
}

impl AbuseScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { records: Arc::new(DashMap::new()), config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Add a violation for `actor` and apply the escalation rule.
    pub fn record_violation(
        &self,
        actor: &ActorId,
        action: &str,
        penalty_multiplier: f64,
        now: Timestamp,
    ) -> ViolationOutcome {
        let cfg = self.config;
        let mut record = self.records.entry(actor.clone()).or_default();

        let prior = record.recent(now - cfg.lookback_secs);
        let exponent = prior.min(cfg.cap_exponent as usize) as i32;
        let score_delta = cfg.base_penalty * penalty_multiplier.max(1.0).powi(exponent);
        record.score += score_delta;

        record.history.push_back(ViolationRecord {
            timestamp: now,
            action: action.to_string(),
            score_delta,
        });
        while record.history.len() > cfg.history_cap {
            record.history.pop_front();
        }

        let newly_blocked = record.state == ActorState::Normal && record.score > cfg.threshold;
        if newly_blocked {
            record.state = ActorState::Blocked;
        }

        ViolationOutcome {
            score_delta,
            score: record.score,
            recent_violations: (prior + 1).min(cfg.history_cap),
            escalated: score_delta > cfg.base_penalty,
            newly_blocked,
        }
    }

    pub fn is_blocked(&self, actor: &ActorId) -> bool {
        self.records.get(actor).is_some_and(|r| r.state == ActorState::Blocked)
    }

    pub fn score(&self, actor: &ActorId) -> f64 {
        self.records.get(actor).map_or(0.0, |r| r.score)
    }

    /// Violations for `actor` within the lookback period ending at `now`.
    pub fn recent_violations(&self, actor: &ActorId, now: Timestamp) -> usize {
        self.records.get(actor).map_or(0, |r| r.recent(now - self.config.lookback_secs))
    }

    pub fn snapshot(&self, actor: &ActorId, now: Timestamp) -> AbuseSnapshot {
        self.records.get(actor).map_or_else(AbuseSnapshot::default, |r| AbuseSnapshot {
            score: r.score,
            violation_count: r.history.len(),
            recent_violations: r.recent(now - self.config.lookback_secs),
            state: r.state,
        })
    }

    /// Violation history, oldest first.
    pub fn history(&self, actor: &ActorId) -> Vec<ViolationRecord> {
        self.records.get(actor).map(|r| r.history.iter().cloned().collect()).unwrap_or_default()
    }

    /// Clear score and history and return the actor to Normal.
    ///
    /// Returns `true` if the actor was blocked.
    pub fn reset(&self, actor: &ActorId) -> bool {
        // Removing under the shard lock means a concurrent violation lands
        // either before (and is cleared) or after (on a fresh record).
        self.records.remove(actor).is_some_and(|(_, r)| r.state == ActorState::Blocked)
    }

    /// Currently blocked actors, sorted.
    pub fn blocked_actors(&self) -> Vec<ActorId> {
        let mut blocked: Vec<ActorId> = self
            .records
            .iter()
            .filter(|r| r.state == ActorState::Blocked)
            .map(|r| r.key().clone())
            .collect();
        blocked.sort();
        blocked
    }
}
