//! Bucket invariants under arbitrary request sequences, plus the concrete
//! refill and contention scenarios.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use quotad::config::LimiterConfig;
use quotad::limiter::Limiter;
use quotad::quota::{LeakyBucketConfig, Policy, TokenBucketConfig};
use quotad::ManualClock;

fn limiter_with(clock: Arc<ManualClock>) -> Limiter {
    let config = LimiterConfig {
        lock_timeout: Duration::from_secs(5),
        ..LimiterConfig::default()
    };
    Limiter::new(&config, clock)
}

fn token_bucket(capacity: f64, refill_rate: f64, burst: f64) -> Policy {
    Policy::TokenBucket(TokenBucketConfig { capacity, refill_rate, burst })
}

/// (cost, milliseconds to advance before the check)
fn steps() -> impl Strategy<Value = Vec<(u32, u64)>> {
    prop::collection::vec((1u32..=5, 0u64..=2_000), 1..64)
}

proptest! {
    #[test]
    fn token_level_stays_within_bounds(
        capacity in 1u32..=50,
        burst in 0u32..=10,
        refill_rate in 0.0f64..=20.0,
        steps in steps(),
    ) {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(Arc::clone(&clock));
        let ceiling = f64::from(capacity + burst);
        limiter.install("q", token_bucket(f64::from(capacity), refill_rate, f64::from(burst)), true);

        for (cost, advance_ms) in steps {
            clock.advance(Duration::from_millis(advance_ms));
            let before = limiter.status("q").unwrap().level;
            let decision = limiter.check("q", cost).unwrap();

            prop_assert!(decision.level >= 0.0);
            prop_assert!(decision.level <= ceiling);
            if decision.allowed {
                prop_assert!(before >= f64::from(cost));
                prop_assert!((before - f64::from(cost) - decision.level).abs() < 1e-9);
            } else {
                prop_assert!(before < f64::from(cost));
            }
        }
    }

    #[test]
    fn token_grants_never_exceed_ceiling_without_refill(
        capacity in 1u32..=50,
        burst in 0u32..=10,
        costs in prop::collection::vec(1u32..=5, 1..128),
    ) {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(clock);
        limiter.install("q", token_bucket(f64::from(capacity), 0.0, f64::from(burst)), true);

        let granted: u32 = costs
            .into_iter()
            .filter(|cost| limiter.check("q", *cost).unwrap().allowed)
            .sum();
        prop_assert!(granted <= capacity + burst);
    }

    #[test]
    fn leaky_depth_never_exceeds_capacity(
        capacity in 1u32..=50,
        leak_rate in 0.0f64..=20.0,
        steps in steps(),
    ) {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(Arc::clone(&clock));
        let capacity = f64::from(capacity);
        limiter.install("q", Policy::LeakyBucket(LeakyBucketConfig { capacity, leak_rate }), true);

        for (cost, advance_ms) in steps {
            clock.advance(Duration::from_millis(advance_ms));
            let decision = limiter.check("q", cost).unwrap();
            prop_assert!(decision.level >= 0.0);
            prop_assert!(decision.level <= capacity);
            prop_assert!((decision.remaining_capacity - (capacity - decision.level)).abs() < 1e-9);
        }
    }

    #[test]
    fn disabled_quota_always_admits_and_never_moves(
        costs in prop::collection::vec(1u32..=100, 1..32),
    ) {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter_with(clock);
        limiter.install("q", token_bucket(3.0, 1.0, 0.0), false);

        for cost in costs {
            let decision = limiter.check("q", cost).unwrap();
            prop_assert!(decision.allowed);
            prop_assert!(decision.bypassed);
            prop_assert_eq!(decision.level, 3.0);
        }
    }
}

#[test]
fn ten_per_second_refills_one_token_per_tenth() {
    let clock = Arc::new(ManualClock::new());
    let limiter = limiter_with(Arc::clone(&clock));
    limiter.install("q", token_bucket(10.0, 10.0, 0.0), true);

    for _ in 0..10 {
        assert!(limiter.check("q", 1).unwrap().allowed);
    }
    assert!(!limiter.check("q", 1).unwrap().allowed);

    clock.advance(Duration::from_millis(100));
    let decision = limiter.check("q", 1).unwrap();
    assert!(decision.allowed);
    assert!(decision.level.abs() < 1e-9);
    assert!(!limiter.check("q", 1).unwrap().allowed);

    clock.advance(Duration::from_secs(5));
    assert_eq!(limiter.status("q").unwrap().level, 10.0);
}

#[test]
fn concurrent_callers_get_exactly_capacity() {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(limiter_with(clock));
    limiter.install("q", token_bucket(100.0, 0.0, 0.0), true);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                (0..25)
                    .filter(|_| limiter.check("q", 1).unwrap().allowed)
                    .count()
            })
        })
        .collect();

    let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allowed, 100);
    assert_eq!(limiter.status("q").unwrap().level, 0.0);
}

fn grants_while_clock_moves(policy: Policy, ceiling: f64, rate: f64) {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(limiter_with(Arc::clone(&clock)));
    limiter.install("q", policy, true);

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                (0..400)
                    .filter(|_| limiter.check("q", 1).unwrap().allowed)
                    .count()
            })
        })
        .collect();

    let ticks = 50;
    for _ in 0..ticks {
        clock.advance(Duration::from_millis(100));
        thread::yield_now();
    }

    let granted: usize = callers.into_iter().map(|h| h.join().unwrap()).sum();
    let elapsed = f64::from(ticks) * 0.1;
    assert!(granted as f64 <= ceiling + elapsed * rate + 1e-9);
}

#[test]
fn token_refill_under_contention_tracks_elapsed_time() {
    grants_while_clock_moves(token_bucket(10.0, 10.0, 0.0), 10.0, 10.0);
}

#[test]
fn leaky_drain_under_contention_tracks_elapsed_time() {
    let leaky = Policy::LeakyBucket(LeakyBucketConfig { capacity: 10.0, leak_rate: 10.0 });
    grants_while_clock_moves(leaky, 10.0, 10.0);
}

#[test]
fn quotas_are_independent() {
    let clock = Arc::new(ManualClock::new());
    let limiter = limiter_with(clock);
    limiter.install("a", token_bucket(1.0, 0.0, 0.0), true);
    limiter.install("b", token_bucket(1.0, 0.0, 0.0), true);

    assert!(limiter.check("a", 1).unwrap().allowed);
    assert!(!limiter.check("a", 1).unwrap().allowed);
    assert!(limiter.check("b", 1).unwrap().allowed);
}
