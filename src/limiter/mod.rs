pub mod leaky_bucket;
pub mod token_bucket;

use crate::clock::Clock;
use crate::config::{FailurePolicy, LimiterConfig};
use crate::errors::{LimiterError, Result};
use crate::metrics;
use crate::quota::Policy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq)]
pub struct LimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Tokens left (token bucket) or free queue room (leaky bucket)
    pub remaining_capacity: f64,

    /// Raw `current_tokens` after the check
    pub level: f64,

    /// Nominal capacity of the quota
    pub capacity: f64,

    /// The quota is disabled and the request skipped accounting
    pub bypassed: bool,

    /// Set when the decision came from the failure policy
    pub fault: Option<String>,
}

/// Bucket status without consuming tokens
#[derive(Debug, Clone, PartialEq)]
pub struct BucketStatus {
    pub algo: &'static str,
    pub enabled: bool,
    pub level: f64,
    pub remaining_capacity: f64,
    pub capacity: f64,
}

/// Per-quota accounting state; never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterState {
    pub current_tokens: f64,
    pub last_refill_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    policy: Policy,
    enabled: bool,
    state: LimiterState,
}

impl Bucket {
    fn new(policy: Policy, enabled: bool, now: Instant) -> Self {
        let current_tokens = match &policy {
            Policy::TokenBucket(cfg) => token_bucket::initial_level(cfg),
            Policy::LeakyBucket(_) => leaky_bucket::initial_level(),
        };
        Self {
            policy,
            enabled,
            state: LimiterState {
                current_tokens,
                last_refill_at: now,
            },
        }
    }

    /// Bring the level up to `now` without admitting anything.
    fn settle(&mut self, now: Instant) {
        match &self.policy {
            Policy::TokenBucket(cfg) => token_bucket::refill(cfg, &mut self.state, now),
            Policy::LeakyBucket(cfg) => leaky_bucket::leak(cfg, &mut self.state, now),
        }
    }

    fn try_admit(&mut self, cost: f64, now: Instant) -> bool {
        match &self.policy {
            Policy::TokenBucket(cfg) => token_bucket::try_acquire(cfg, &mut self.state, cost, now),
            Policy::LeakyBucket(cfg) => leaky_bucket::try_enqueue(cfg, &mut self.state, cost, now),
        }
    }

    fn remaining(&self) -> f64 {
        match &self.policy {
            Policy::TokenBucket(_) => token_bucket::remaining(&self.state),
            Policy::LeakyBucket(cfg) => leaky_bucket::remaining(cfg, &self.state),
        }
    }

    /// Swap parameters in place.
    ///
    /// The level is settled under the old parameters first, then re-clamped
    /// to the new ceiling. Switching algorithm starts from the new
    /// algorithm's initial level since the two levels mean different things.
    fn reconfigure(&mut self, policy: Policy, enabled: bool, now: Instant) {
        self.settle(now);
        if !self.policy.same_algorithm(&policy) {
            *self = Bucket::new(policy, enabled, now);
            return;
        }

        self.policy = policy;
        self.enabled = enabled;
        match &self.policy {
            Policy::TokenBucket(cfg) => token_bucket::clamp(cfg, &mut self.state),
            Policy::LeakyBucket(cfg) => leaky_bucket::clamp(cfg, &mut self.state),
        }
    }

    fn status(&self) -> BucketStatus {
        BucketStatus {
            algo: self.policy.algo(),
            enabled: self.enabled,
            level: self.state.current_tokens,
            remaining_capacity: self.remaining(),
            capacity: self.policy.capacity(),
        }
    }
}

struct Slot {
    bucket: Mutex<Bucket>,
    retired: AtomicBool,
}

#[cfg(test)]
pub(crate) struct HeldSlot {
    release: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

#[cfg(test)]
impl Drop for HeldSlot {
    fn drop(&mut self) {
        self.release.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// In-memory admission engine.
///
/// Each quota id owns one independently locked slot; checks on different
/// quotas never contend. Slots are handed out as `Arc`s so a quota removed
/// while a check is running finishes that check and answers `NotFound`
/// afterwards.
pub struct Limiter {
    slots: DashMap<String, Arc<Slot>>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    failure_policy: FailurePolicy,
}

impl Limiter {
    pub fn new(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            lock_timeout: config.lock_timeout,
            failure_policy: config.failure_policy,
        }
    }

    /// Create the slot for `id`, or reconfigure it if it already exists.
    pub fn install(&self, id: &str, policy: Policy, enabled: bool) {
        let existing = match self.slots.entry(id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Slot {
                    bucket: Mutex::new(Bucket::new(policy, enabled, self.clock.now())),
                    retired: AtomicBool::new(false),
                }));
                debug!(quota_id = id, algo = policy.algo(), "Installed limiter slot");
                return;
            }
        };
        let mut bucket = existing.bucket.lock();
        bucket.reconfigure(policy, enabled, self.clock.now());
    }

    /// Apply new parameters to a live quota without resetting its level.
    pub fn configure(&self, id: &str, policy: Policy, enabled: bool) -> Result<()> {
        let slot = self.slot(id)?;
        let mut bucket = slot.bucket.lock();
        bucket.reconfigure(policy, enabled, self.clock.now());
        drop(bucket);
        debug!(quota_id = id, algo = policy.algo(), enabled, "Reconfigured limiter slot");
        Ok(())
    }

    /// Flip the enabled gate. Accounting state is left exactly as it was.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let slot = self.slot(id)?;
        slot.bucket.lock().enabled = enabled;
        Ok(())
    }

    /// Remove a quota. Returns whether it existed.
    pub fn retire(&self, id: &str) -> bool {
        match self.slots.remove(id) {
            Some((_, slot)) => {
                // Taking the lock orders this after any in-flight check.
                let _bucket = slot.bucket.lock();
                slot.retired.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Check and consume `cost` units for quota `id`.
    pub fn check(&self, id: &str, cost: u32) -> Result<LimitDecision> {
        let slot = self.slot(id)?;

        let Some(mut bucket) = slot.bucket.try_lock_for(self.lock_timeout) else {
            metrics::record_lock_timeout(id);
            warn!(
                quota_id = id,
                policy = ?self.failure_policy,
                "Timed out waiting for quota lock"
            );
            return Ok(self.failure_decision());
        };

        if slot.retired.load(Ordering::Acquire) {
            return Err(LimiterError::quota_not_found(id));
        }

        if !bucket.enabled {
            return Ok(LimitDecision {
                allowed: true,
                remaining_capacity: bucket.remaining(),
                level: bucket.state.current_tokens,
                capacity: bucket.policy.capacity(),
                bypassed: true,
                fault: None,
            });
        }

        // Read under the lock so callers settle in the order they hold it.
        let now = self.clock.now();
        let allowed = bucket.try_admit(f64::from(cost), now);
        let decision = LimitDecision {
            allowed,
            remaining_capacity: bucket.remaining(),
            level: bucket.state.current_tokens,
            capacity: bucket.policy.capacity(),
            bypassed: false,
            fault: None,
        };
        drop(bucket);

        debug!(
            quota_id = id,
            cost,
            allowed = decision.allowed,
            remaining = decision.remaining_capacity,
            "Admission decision"
        );
        Ok(decision)
    }

    /// Current status projected to now, without consuming or moving
    /// `last_refill_at`.
    pub fn status(&self, id: &str) -> Result<BucketStatus> {
        let slot = self.slot(id)?;
        let mut projected = *slot.bucket.lock();
        let now = self.clock.now();
        if projected.enabled {
            projected.settle(now);
        }
        Ok(projected.status())
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>> {
        self.slots
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LimiterError::quota_not_found(id))
    }

    /// Keep `id`'s slot locked from another thread until the handle drops.
    #[cfg(test)]
    pub(crate) fn hold_slot(&self, id: &str) -> HeldSlot {
        use std::sync::mpsc;

        let slot = self.slot(id).unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            let _held = slot.bucket.lock();
            let _ = ready_tx.send(());
            let _ = release_rx.recv();
        });
        ready_rx.recv().unwrap();
        HeldSlot {
            release: Some(release_tx),
            worker: Some(worker),
        }
    }

    fn failure_decision(&self) -> LimitDecision {
        LimitDecision {
            allowed: self.failure_policy == FailurePolicy::FailOpen,
            remaining_capacity: 0.0,
            level: 0.0,
            capacity: 0.0,
            bypassed: false,
            fault: Some(match self.failure_policy {
                FailurePolicy::FailClosed => "lock timeout, failing closed".to_string(),
                FailurePolicy::FailOpen => "lock timeout, failing open".to_string(),
            }),
        }
    }
}
