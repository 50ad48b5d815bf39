mod common;

use abuseguard::{GuardError, RateLimiter, Strategy};
use common::limit;

#[tokio::test]
async fn unregistered_action_fails_loudly() {
    let limiter = RateLimiter::new([limit("login", 5, 300, Strategy::FixedWindow)]);
    let err = limiter.check("U1", "pack_create", 0.0).await.unwrap_err();
    assert_eq!(err, GuardError::UnknownAction { action: "pack_create".into() });
    assert!(limiter.local_store().is_empty());
}

#[tokio::test]
async fn last_registration_wins() {
    let limiter = RateLimiter::new([limit("login", 5, 300, Strategy::FixedWindow)]);
    limiter.register_limit(limit("login", 2, 300, Strategy::FixedWindow));
    limiter.register_limit(limit("login", 2, 300, Strategy::FixedWindow));
    assert_eq!(limiter.registry().len(), 1);

    assert!(limiter.check("U1", "login", 0.0).await.unwrap().allowed);
    assert!(limiter.check("U1", "login", 0.0).await.unwrap().allowed);
    let d = limiter.check("U1", "login", 0.0).await.unwrap();
    assert!(!d.allowed);
    assert_eq!(d.limit, 2);
}

#[tokio::test]
async fn strategy_change_starts_fresh_state() {
    let limiter = RateLimiter::new([limit("api_call", 2, 60, Strategy::TokenBucket)]);
    limiter.check("U1", "api_call", 0.0).await.unwrap();
    limiter.check("U1", "api_call", 0.0).await.unwrap();
    assert!(!limiter.check("U1", "api_call", 0.0).await.unwrap().allowed);

    limiter.register_limit(limit("api_call", 2, 60, Strategy::SlidingWindow));
    let d = limiter.check("U1", "api_call", 0.0).await.unwrap();
    assert!(d.allowed);
    assert_eq!(d.remaining, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_is_safe_during_checks() {
    let limiter = RateLimiter::new([limit("hot", 1_000_000, 60, Strategy::TokenBucket)]);
    let checker = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            for i in 0..2_000u64 {
                let d = limiter.check(i % 50, "hot", 0.0).await.expect("hot stays registered");
                assert!(d.allowed);
            }
        })
    };
    let registrar = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                limiter.register_limit(limit(&format!("new{i}"), 5, 60, Strategy::FixedWindow));
                tokio::task::yield_now().await;
            }
        })
    };
    checker.await.unwrap();
    registrar.await.unwrap();
    assert_eq!(limiter.registry().len(), 201);
    assert!(limiter.check("U1", "new199", 0.0).await.unwrap().allowed);
}
