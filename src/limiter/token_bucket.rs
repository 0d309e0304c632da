//! Token bucket accounting.
//!
//! The bucket starts full at `capacity + burst`, refills continuously at
//! `refill_rate` tokens per second and never goes below zero: a request that
//! costs more than what is left is denied and takes nothing.

use crate::limiter::LimiterState;
use crate::quota::TokenBucketConfig;
use std::time::Instant;

pub fn initial_level(cfg: &TokenBucketConfig) -> f64 {
    cfg.ceiling()
}

/// Credit the tokens earned since the last check. An instant older than
/// `last_refill_at` credits nothing and leaves the timestamp where it is.
pub fn refill(cfg: &TokenBucketConfig, state: &mut LimiterState, now: Instant) {
    let elapsed = now.saturating_duration_since(state.last_refill_at).as_secs_f64();
    state.current_tokens = (state.current_tokens + elapsed * cfg.refill_rate).min(cfg.ceiling());
    state.last_refill_at = state.last_refill_at.max(now);
}

pub fn try_acquire(cfg: &TokenBucketConfig, state: &mut LimiterState, cost: f64, now: Instant) -> bool {
    refill(cfg, state, now);
    if state.current_tokens >= cost {
        state.current_tokens -= cost;
        true
    } else {
        false
    }
}

pub fn remaining(state: &LimiterState) -> f64 {
    state.current_tokens
}

pub fn clamp(cfg: &TokenBucketConfig, state: &mut LimiterState) {
    state.current_tokens = state.current_tokens.clamp(0.0, cfg.ceiling());
}
