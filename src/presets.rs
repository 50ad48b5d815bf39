//! Ready-made limit tables.
//!
//! ```rust
//! use abuseguard::{presets, RateLimiter};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = RateLimiter::new(presets::marketplace());
//! let decision = limiter.check("U1", "pack_create", 0.0).await.unwrap();
//! assert_eq!(decision.remaining, 4);
//! # });
//! ```
//!
//! ## Available presets
//!
//! - [`marketplace`]: the action table of a card marketplace
//! - [`strict`]: a copy of any table with adaptive tightening switched on

use crate::config::{RateLimitConfig, Strategy};

// (action, max_requests, window_seconds, strategy, penalty_multiplier)
const MARKETPLACE: &[(&str, u32, u64, Strategy, f64)] = &[
    ("pack_create", 5, 3600, Strategy::SlidingWindow, 2.0),
    ("purchase", 10, 3600, Strategy::SlidingWindow, 2.0),
    ("payment_request", 3, 600, Strategy::SlidingWindow, 2.0),
    ("login", 5, 300, Strategy::FixedWindow, 1.5),
    ("api_call", 60, 60, Strategy::TokenBucket, 1.0),
    ("card_trade", 20, 3600, Strategy::LeakyBucket, 1.5),
];

/// Default limits for pack creation, purchases, payments, logins, API calls
/// and card trades.
///
/// Financial actions use sliding windows; logins tolerate the fixed-window
/// boundary burst; generic API calls allow token-bucket bursts; trades drain
/// at a constant rate.
pub fn marketplace() -> Vec<RateLimitConfig> {
    MARKETPLACE
        .iter()
        .filter_map(|&(action, max, window, strategy, multiplier)| {
            RateLimitConfig::builder(action)
                .max_requests(max)
                .window_seconds(window)
                .strategy(strategy)
                .penalty_multiplier(multiplier)
                .build()
                .ok()
        })
        .collect()
}

/// Same limits with adaptive tightening enabled on every action.
pub fn strict(limits: impl IntoIterator<Item = RateLimitConfig>) -> Vec<RateLimitConfig> {
    limits
        .into_iter()
        .filter_map(|cfg| cfg.to_builder().adaptive(true).build().ok())
        .collect()
}
