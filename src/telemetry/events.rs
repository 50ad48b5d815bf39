//! Security event types and their JSON wire form.

use crate::clock::Timestamp;
use crate::state::ActorId;
use serde::Serialize;
use std::fmt;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A request was denied by its action's limit.
    RateLimitViolation,
    /// A violation was charged above the base penalty because of recent history.
    AbuseScoreEscalated,
    /// The actor's score crossed the threshold; all actions are now denied.
    ActorAutoBlocked,
    /// A blocked actor attempted an action. Not counted as a violation.
    BlockedActorRejected,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::RateLimitViolation => "rate_limit_violation",
            SecurityEventKind::AbuseScoreEscalated => "abuse_score_escalated",
            SecurityEventKind::ActorAutoBlocked => "actor_auto_blocked",
            SecurityEventKind::BlockedActorRejected => "blocked_actor_rejected",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record handed to a [`SecuritySink`](super::SecuritySink).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub kind: SecurityEventKind,
    pub timestamp: Timestamp,
    #[serde(rename = "actorId")]
    pub actor_id: ActorId,
    pub action: String,
    pub score: f64,
    #[serde(rename = "violationCountRecent")]
    pub violation_count_recent: usize,
}

impl SecurityEvent {
    pub fn new(
        kind: SecurityEventKind,
        timestamp: Timestamp,
        actor_id: ActorId,
        action: impl Into<String>,
        score: f64,
        violation_count_recent: usize,
    ) -> Self {
        Self { kind, timestamp, actor_id, action: action.into(), score, violation_count_recent }
    }

    /// JSON form used by audit sinks.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "type": self.kind.as_str(), "actorId": self.actor_id.as_str() })
        })
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(actor={}, action={}, score={:.1}, recent={})",
            self.kind, self.actor_id, self.action, self.score, self.violation_count_recent
        )
    }
}
