//! The four limiting algorithms.
//!
//! Each evaluator is a pure function of `(state, limit, window, now)`: it never
//! touches a store, so the facade can retry it freely inside a compare-and-write
//! loop. Absent state (first request, or expired) starts fresh. State written by
//! a different strategy (the action was re-registered) is also treated as absent.

use crate::clock::Timestamp;
use crate::config::Strategy;
use crate::state::RateLimitState;
use std::collections::VecDeque;

/// Slack for comparisons on accumulated fractional quantities.
const EPSILON: f64 = 1e-9;

/// Outcome of a single evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub allowed: bool,
    /// State to persist, whether or not the request was allowed.
    pub state: RateLimitState,
    /// Requests left after this one.
    pub remaining: u32,
    /// When the window resets or the bucket is back to full capacity.
    pub reset_at: Timestamp,
    /// Seconds until the next allowed attempt; `None` when allowed.
    pub retry_after: Option<f64>,
}

/// Read-only view of state, used for status displays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub remaining: u32,
    pub reset_at: Timestamp,
}

/// Evaluate one request under `strategy`.
pub fn evaluate(
    strategy: Strategy,
    state: Option<&RateLimitState>,
    limit: u32,
    window_secs: u64,
    now: Timestamp,
) -> Evaluation {
    let limit = limit.max(1);
    let window = (window_secs.max(1)) as f64;
    match strategy {
        Strategy::TokenBucket => token_bucket(state, limit, window, now),
        Strategy::SlidingWindow => sliding_window(state, limit, window, now),
        Strategy::FixedWindow => fixed_window(state, limit, window, now),
        Strategy::LeakyBucket => leaky_bucket(state, limit, window, now),
    }
}

/// Compute remaining capacity without consuming anything.
pub fn peek(
    strategy: Strategy,
    state: Option<&RateLimitState>,
    limit: u32,
    window_secs: u64,
    now: Timestamp,
) -> Snapshot {
    let limit = limit.max(1);
    let window = (window_secs.max(1)) as f64;
    let cap = f64::from(limit);
    let rate = cap / window;
    match (strategy, state) {
        (Strategy::TokenBucket, Some(RateLimitState::TokenBucket { tokens, last_refill })) => {
            let available = refill(*tokens, *last_refill, rate, cap, now);
            Snapshot { remaining: whole(available), reset_at: now + (cap - available) / rate }
        }
        (Strategy::SlidingWindow, Some(RateLimitState::SlidingWindow { timestamps })) => {
            let cutoff = now - window;
            let live: Vec<Timestamp> = timestamps.iter().copied().filter(|t| *t > cutoff).collect();
            let used = (live.len() as u32).min(limit);
            let reset_at = live.first().map(|t| t + window).unwrap_or(now);
            Snapshot { remaining: limit - used, reset_at }
        }
        (Strategy::FixedWindow, Some(RateLimitState::FixedWindow { window_start, count }))
            if now < window_start + window =>
        {
            Snapshot { remaining: limit.saturating_sub(*count), reset_at: window_start + window }
        }
        (Strategy::LeakyBucket, Some(RateLimitState::LeakyBucket { queue_level, last_leak })) => {
            let level = leak(*queue_level, *last_leak, rate, cap, now);
            Snapshot { remaining: whole(cap - level), reset_at: now + level / rate }
        }
        (Strategy::FixedWindow, _) => {
            let start = align(now, window);
            Snapshot { remaining: limit, reset_at: start + window }
        }
        _ => Snapshot { remaining: limit, reset_at: now },
    }
}

fn whole(x: f64) -> u32 {
    (x + EPSILON).floor().max(0.0) as u32
}

fn align(now: Timestamp, window: f64) -> Timestamp {
    (now / window).floor() * window
}

fn refill(tokens: f64, last: Timestamp, rate: f64, cap: f64, now: Timestamp) -> f64 {
    let elapsed = (now - last).max(0.0);
    (tokens + elapsed * rate).clamp(0.0, cap)
}

fn leak(level: f64, last: Timestamp, rate: f64, cap: f64, now: Timestamp) -> f64 {
    let elapsed = (now - last).max(0.0);
    (level - elapsed * rate).clamp(0.0, cap)
}

fn token_bucket(state: Option<&RateLimitState>, limit: u32, window: f64, now: Timestamp) -> Evaluation {
    let cap = f64::from(limit);
    let rate = cap / window;
    let (tokens, last) = match state {
        Some(RateLimitState::TokenBucket { tokens, last_refill }) => (*tokens, *last_refill),
        _ => (cap, now),
    };
    let available = refill(tokens, last, rate, cap, now);
    // Out-of-order timestamps must not refill twice.
    let stamp = now.max(last);

    if available + EPSILON >= 1.0 {
        let left = (available - 1.0).max(0.0);
        Evaluation {
            allowed: true,
            state: RateLimitState::TokenBucket { tokens: left, last_refill: stamp },
            remaining: whole(left),
            reset_at: stamp + (cap - left) / rate,
            retry_after: None,
        }
    } else {
        Evaluation {
            allowed: false,
            state: RateLimitState::TokenBucket { tokens: available, last_refill: stamp },
            remaining: 0,
            reset_at: stamp + (cap - available) / rate,
            retry_after: Some((1.0 - available) / rate),
        }
    }
}

fn sliding_window(
    state: Option<&RateLimitState>,
    limit: u32,
    window: f64,
    now: Timestamp,
) -> Evaluation {
    let mut timestamps = match state {
        Some(RateLimitState::SlidingWindow { timestamps }) => timestamps.clone(),
        _ => VecDeque::new(),
    };
    // An entry exactly `window` old has expired, so waiting a full window always frees a slot.
    let cutoff = now - window;
    while timestamps.front().is_some_and(|t| *t <= cutoff) {
        timestamps.pop_front();
    }
    let cap = limit as usize;
    while timestamps.len() > cap {
        timestamps.pop_front();
    }

    if timestamps.len() < cap {
        let stamp = timestamps.back().map_or(now, |last| now.max(*last));
        timestamps.push_back(stamp);
        let reset_at = timestamps.front().map_or(stamp, |t| t + window);
        let remaining = (cap - timestamps.len()) as u32;
        Evaluation {
            allowed: true,
            state: RateLimitState::SlidingWindow { timestamps },
            remaining,
            reset_at,
            retry_after: None,
        }
    } else {
        let reset_at = timestamps.front().map_or(now, |t| t + window);
        Evaluation {
            allowed: false,
            state: RateLimitState::SlidingWindow { timestamps },
            remaining: 0,
            reset_at,
            retry_after: Some((reset_at - now).max(0.0)),
        }
    }
}

fn fixed_window(state: Option<&RateLimitState>, limit: u32, window: f64, now: Timestamp) -> Evaluation {
    let (window_start, count) = match state {
        Some(RateLimitState::FixedWindow { window_start, count }) if now < window_start + window => {
            (*window_start, *count)
        }
        _ => (align(now, window), 0),
    };
    let reset_at = window_start + window;

    if count < limit {
        let count = count + 1;
        Evaluation {
            allowed: true,
            state: RateLimitState::FixedWindow { window_start, count },
            remaining: limit - count,
            reset_at,
            retry_after: None,
        }
    } else {
        Evaluation {
            allowed: false,
            state: RateLimitState::FixedWindow { window_start, count },
            remaining: 0,
            reset_at,
            retry_after: Some((reset_at - now).max(0.0)),
        }
    }
}

fn leaky_bucket(state: Option<&RateLimitState>, limit: u32, window: f64, now: Timestamp) -> Evaluation {
    let cap = f64::from(limit);
    let rate = cap / window;
    let (level, last) = match state {
        Some(RateLimitState::LeakyBucket { queue_level, last_leak }) => (*queue_level, *last_leak),
        _ => (0.0, now),
    };
    let level = leak(level, last, rate, cap, now);
    let stamp = now.max(last);

    if level + 1.0 <= cap + EPSILON {
        let level = (level + 1.0).min(cap);
        Evaluation {
            allowed: true,
            state: RateLimitState::LeakyBucket { queue_level: level, last_leak: stamp },
            remaining: whole(cap - level),
            reset_at: stamp + level / rate,
            retry_after: None,
        }
    } else {
        Evaluation {
            allowed: false,
            state: RateLimitState::LeakyBucket { queue_level: level, last_leak: stamp },
            remaining: 0,
            reset_at: stamp + level / rate,
            retry_after: Some((level + 1.0 - cap) / rate),
        }
    }
}
