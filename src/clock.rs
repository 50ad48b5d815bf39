//! Clock abstractions used by the rate limiter and abuse scorer.
//!
//! Every engine operation accepts `now` explicitly; the clock only backs the
//! `*_now` convenience methods and the background sweeper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, with sub-second precision.
pub type Timestamp = f64;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock backed by `SystemTime::now()`.
///
/// Window boundaries and `reset_at` values are wall time so that instances
/// sharing a backend agree on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Manually driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { bits: Arc::new(AtomicU64::new(start.to_bits())) }
    }

    pub fn set(&self, now: Timestamp) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        let _ = self.bits.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            Some((f64::from_bits(cur) + secs).to_bits())
        });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(10.0);
        let other = clock.clone();
        clock.advance(2.5);
        assert_eq!(other.now(), 12.5);
        other.set(100.0);
        assert_eq!(clock.now(), 100.0);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now() > 1_577_836_800.0);
    }
}
