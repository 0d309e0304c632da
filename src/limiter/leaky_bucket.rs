//! Leaky bucket accounting.
//!
//! `current_tokens` is the queue depth. It drains at `leak_rate` per second
//! and a request is admitted while its cost still fits under `capacity`.

use crate::limiter::LimiterState;
use crate::quota::LeakyBucketConfig;
use std::time::Instant;

pub fn initial_level() -> f64 {
    0.0
}

/// Drain what leaked out since the last check. An instant older than
/// `last_refill_at` drains nothing and leaves the timestamp where it is.
pub fn leak(cfg: &LeakyBucketConfig, state: &mut LimiterState, now: Instant) {
    let elapsed = now.saturating_duration_since(state.last_refill_at).as_secs_f64();
    state.current_tokens = (state.current_tokens - elapsed * cfg.leak_rate).max(0.0);
    state.last_refill_at = state.last_refill_at.max(now);
}

pub fn try_enqueue(cfg: &LeakyBucketConfig, state: &mut LimiterState, cost: f64, now: Instant) -> bool {
    leak(cfg, state, now);
    let depth = state.current_tokens + cost;
    if depth <= cfg.capacity {
        state.current_tokens = depth;
        true
    } else {
        false
    }
}

/// Free room left in the queue.
pub fn remaining(cfg: &LeakyBucketConfig, state: &LimiterState) -> f64 {
    (cfg.capacity - state.current_tokens).max(0.0)
}

pub fn clamp(cfg: &LeakyBucketConfig, state: &mut LimiterState) {
    state.current_tokens = state.current_tokens.clamp(0.0, cfg.capacity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn queue_fills_then_rejects() {
        let cfg = LeakyBucketConfig { capacity: 3.0, leak_rate: 1.0 };
        let now = Instant::now();
        let mut state = LimiterState { current_tokens: initial_level(), last_refill_at: now };

        for _ in 0..3 {
            assert!(try_enqueue(&cfg, &mut state, 1.0, now));
        }
        assert!(!try_enqueue(&cfg, &mut state, 1.0, now));
        assert_eq!(state.current_tokens, 3.0);
        assert_eq!(remaining(&cfg, &state), 0.0);
    }

    #[test]
    fn leaking_makes_room_and_never_goes_negative() {
        let cfg = LeakyBucketConfig { capacity: 4.0, leak_rate: 2.0 };
        let start = Instant::now();
        let mut state = LimiterState { current_tokens: 4.0, last_refill_at: start };

        assert!(try_enqueue(&cfg, &mut state, 2.0, start + Duration::from_secs(1)));
        assert_eq!(state.current_tokens, 4.0);

        leak(&cfg, &mut state, start + Duration::from_secs(60));
        assert_eq!(state.current_tokens, 0.0);
    }

    #[test]
    fn stale_instant_never_drains_twice() {
        let cfg = LeakyBucketConfig { capacity: 100.0, leak_rate: 1.0 };
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        let mut state = LimiterState { current_tokens: 100.0, last_refill_at: start };

        leak(&cfg, &mut state, later);
        leak(&cfg, &mut state, start);
        leak(&cfg, &mut state, later);

        assert_eq!(state.current_tokens, 90.0);
        assert_eq!(state.last_refill_at, later);
    }

    #[test]
    fn cost_larger_than_capacity_is_always_rejected() {
        let cfg = LeakyBucketConfig { capacity: 2.0, leak_rate: 10.0 };
        let now = Instant::now();
        let mut state = LimiterState { current_tokens: 0.0, last_refill_at: now };

        assert!(!try_enqueue(&cfg, &mut state, 3.0, now));
        assert_eq!(state.current_tokens, 0.0);
    }
}
