use abuseguard::telemetry::{MemorySink, SecurityEventKind};
use abuseguard::{EngineConfig, RateLimitConfig, RateLimiter, Strategy as Algorithm};
use proptest::prelude::*;

fn login(multiplier: f64) -> RateLimitConfig {
    RateLimitConfig::builder("login")
        .max_requests(1)
        .window_seconds(300)
        .strategy(Algorithm::FixedWindow)
        .penalty_multiplier(multiplier)
        .build()
        .unwrap()
}

/// Scores after each denied check at `times`.
async fn scores_for(times: &[f64], multiplier: f64) -> Vec<f64> {
    let config = EngineConfig { abuse_threshold: 1e12, ..EngineConfig::default() };
    let limiter = RateLimiter::builder().config(config).limit(login(multiplier)).build().unwrap();
    // Consume the single slot of every fixed window touched.
    let mut scores = Vec::new();
    for &t in times {
        limiter.check("U1", "login", t).await.unwrap();
        let d = limiter.check("U1", "login", t).await.unwrap();
        assert!(!d.allowed);
        scores.push(d.abuse_score);
    }
    scores
}

#[tokio::test]
async fn penalties_escalate_then_cap() {
    let times: Vec<f64> = (0..8).map(|i| f64::from(i) * 400.0).collect();
    let scores = scores_for(&times, 2.0).await;
    let deltas: Vec<f64> =
        scores.iter().scan(0.0, |prev, s| { let d = s - *prev; *prev = *s; Some(d) }).collect();
    assert_eq!(deltas, vec![10.0, 20.0, 40.0, 80.0, 160.0, 320.0, 320.0, 320.0]);
}

#[tokio::test]
async fn lookback_is_one_hour_across_actions() {
    let limiter = RateLimiter::builder()
        .config(EngineConfig { abuse_threshold: 1e12, ..EngineConfig::default() })
        .limit(login(3.0))
        .limit(
            RateLimitConfig::builder("purchase")
                .max_requests(1)
                .window_seconds(3600)
                .penalty_multiplier(3.0)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    limiter.check("U1", "login", 0.0).await.unwrap();
    assert_eq!(limiter.check("U1", "login", 0.0).await.unwrap().abuse_score, 10.0);
    limiter.check("U1", "purchase", 10.0).await.unwrap();
    // One earlier violation on another action: 10 * 3^1.
    assert_eq!(limiter.check("U1", "purchase", 10.0).await.unwrap().abuse_score, 40.0);
    // Both earlier violations are older than an hour: back to the base penalty.
    assert!(limiter.check("U1", "login", 3700.0).await.unwrap().allowed);
    assert_eq!(limiter.check("U1", "login", 3700.0).await.unwrap().abuse_score, 50.0);
}

#[tokio::test]
async fn escalation_and_block_events() {
    let sink = MemorySink::new();
    let limiter = RateLimiter::builder().limit(login(2.0)).sink(sink.clone()).build().unwrap();

    let mut t = 0.0;
    loop {
        limiter.check("U1", "login", t).await.unwrap();
        let d = limiter.check("U1", "login", t).await.unwrap();
        if d.blocked {
            break;
        }
        t += 300.0;
        assert!(t < 3600.0, "never blocked");
    }
    // 10 + 20 + 40 = 70, then +80 = 150 > 100.
    assert_eq!(limiter.get_status("U1", t).await.unwrap().score, 150.0);
    limiter.flush_events().await;

    let kinds: Vec<SecurityEventKind> = sink.events().iter().map(|e| e.kind).collect();
    assert_eq!(kinds.iter().filter(|k| **k == SecurityEventKind::RateLimitViolation).count(), 4);
    assert_eq!(kinds.iter().filter(|k| **k == SecurityEventKind::AbuseScoreEscalated).count(), 3);
    assert_eq!(kinds.last(), Some(&SecurityEventKind::ActorAutoBlocked));
    let blocked = sink.events().pop().unwrap();
    assert_eq!(blocked.violation_count_recent, 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn score_is_deterministic_and_strictly_increasing(
        mut gaps in prop::collection::vec(300.0f64..2000.0, 1..20),
        multiplier in 1.0f64..3.0,
    ) {
        let mut t = 0.0;
        for gap in gaps.iter_mut() {
            t += *gap;
            *gap = t;
        }
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let first = rt.block_on(scores_for(&gaps, multiplier));
        let second = rt.block_on(scores_for(&gaps, multiplier));
        prop_assert_eq!(&first, &second);
        prop_assert!(first.windows(2).all(|w| w[1] > w[0]));
    }
}
