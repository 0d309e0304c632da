//! Admission front door: limiter check, then trace, metrics and live events.
//!
//! The limiter lock is released before anything is recorded, so a slow
//! trace queue or event subscriber never holds up other callers of the same
//! quota.

use crate::clock::Clock;
use crate::errors::{LimiterError, Result};
use crate::events::{Event, EventBroadcaster, TokenLevel};
use crate::limiter::{LimitDecision, Limiter};
use crate::metrics::{self, MetricsAggregator, Outcome};
use crate::trace::{NewTrace, TraceRecorder};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Body of `POST /limiter/acquire`
#[derive(Debug, Clone, Deserialize)]
pub struct AcquireRequest {
    pub qid: String,
    #[serde(default = "default_cost")]
    pub cost: u32,
    /// Whether the caller's own work succeeded; only meaningful when allowed
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub func_id: Option<String>,
    #[serde(default)]
    pub func_name: Option<String>,
}

impl AcquireRequest {
    pub fn new(qid: impl Into<String>) -> Self {
        Self {
            qid: qid.into(),
            cost: 1,
            success: true,
            latency_ms: None,
            message: None,
            func_id: None,
            func_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquireResponse {
    pub allow: bool,
    pub remain: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub tokens_remain: f64,
    pub trace_id: u64,
}

impl From<&Admission> for AcquireResponse {
    fn from(admission: &Admission) -> Self {
        Self {
            allow: admission.allowed,
            remain: admission.tokens_remain,
        }
    }
}

/// Backoff between denied attempts of a guarded call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Identity of a guarded call as it appears in traces.
#[derive(Debug, Clone)]
pub struct GuardedCall {
    pub quota_id: String,
    pub cost: u32,
    pub func_id: Option<String>,
    pub func_name: Option<String>,
    pub retry: RetryPolicy,
}

impl GuardedCall {
    pub fn new(quota_id: impl Into<String>) -> Self {
        Self {
            quota_id: quota_id.into(),
            cost: 1,
            func_id: None,
            func_name: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn func(mut self, func_id: impl Into<String>, func_name: impl Into<String>) -> Self {
        self.func_id = Some(func_id.into());
        self.func_name = Some(func_name.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct AdmissionGate {
    limiter: Arc<Limiter>,
    recorder: Arc<TraceRecorder>,
    aggregator: Arc<MetricsAggregator>,
    events: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    pub fn new(
        limiter: Arc<Limiter>,
        recorder: Arc<TraceRecorder>,
        aggregator: Arc<MetricsAggregator>,
        events: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            recorder,
            aggregator,
            events,
            clock,
        }
    }

    /// Check `cost` units against `quota_id` and record the decision.
    pub async fn admit(&self, quota_id: &str, cost: u32) -> Result<Admission> {
        let mut request = AcquireRequest::new(quota_id);
        request.cost = cost;
        self.acquire(&request).await
    }

    /// Admission as reported by an external caller, who also tells us how
    /// its own work went.
    pub async fn acquire(&self, request: &AcquireRequest) -> Result<Admission> {
        let decision = self.check(&request.qid, request.cost)?;

        let status_code = match (decision.allowed, request.success) {
            (false, _) => 429,
            (true, true) => 200,
            (true, false) => 500,
        };
        // A failure-policy fault is always kept, after the caller's own text.
        let message = match (request.message.as_deref(), decision.fault.as_deref()) {
            (Some(own), Some(fault)) => Some(format!("{own}; {fault}")),
            (Some(own), None) => Some(own.to_string()),
            (None, Some(fault)) => Some(fault.to_string()),
            (None, None) => decision.bypassed.then(|| "quota disabled, not enforced".to_string()),
        };

        let mut trace = NewTrace::new(request.qid.clone(), status_code)
            .func(request.func_id.clone(), request.func_name.clone())
            .latency_ms(request.latency_ms);
        if let Some(message) = message {
            trace = trace.message(message);
        }
        let trace_id = self.record(trace).await;

        Ok(Admission {
            allowed: decision.allowed,
            tokens_remain: decision.remaining_capacity,
            trace_id,
        })
    }

    /// Run `op` under `call.quota_id`.
    ///
    /// Denials are retried with exponential backoff; once the retries are
    /// spent the call fails with `Denied`. An admitted call is traced 200 or
    /// 500 with its measured latency. Tokens are never refunded.
    pub async fn guard<F, Fut, T, E>(&self, call: &GuardedCall, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            let decision = self.check(&call.quota_id, call.cost)?;
            if decision.allowed {
                break;
            }

            let mut trace = NewTrace::new(call.quota_id.clone(), 429)
                .func(call.func_id.clone(), call.func_name.clone());
            if let Some(fault) = decision.fault {
                trace = trace.message(fault);
            }
            self.record(trace).await;

            if attempt >= call.retry.max_retries {
                warn!(
                    quota_id = %call.quota_id,
                    attempts = attempt + 1,
                    "Guarded call still denied after retries"
                );
                return Err(LimiterError::Denied(call.quota_id.clone()));
            }
            let delay = call.retry.delay(attempt);
            debug!(quota_id = %call.quota_id, attempt, ?delay, "Denied, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }

        let started = Instant::now();
        let result = op().await.map_err(|e| e.to_string());
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let status_code = if result.is_ok() { 200 } else { 500 };
        let mut trace = NewTrace::new(call.quota_id.clone(), status_code)
            .func(call.func_id.clone(), call.func_name.clone())
            .latency_ms(Some(latency_ms));
        if let Err(message) = &result {
            trace = trace.message(message.clone());
        }
        self.record(trace).await;

        result.map_err(LimiterError::DownstreamFailure)
    }

    fn check(&self, quota_id: &str, cost: u32) -> Result<LimitDecision> {
        if cost == 0 {
            return Err(LimiterError::InvalidRequest("cost must be at least 1".into()));
        }

        let started = Instant::now();
        let decision = self.limiter.check(quota_id, cost)?;
        let outcome = match (decision.allowed, decision.bypassed) {
            (false, _) => "denied",
            (true, true) => "bypassed",
            (true, false) => "allowed",
        };
        metrics::record_admission(quota_id, outcome, started.elapsed().as_secs_f64());

        if decision.fault.is_none() {
            self.aggregator.set_tokens(quota_id, decision.remaining_capacity);
            self.events.publish(Event::Tokens(TokenLevel {
                quota_id: quota_id.to_string(),
                tokens_remain: decision.remaining_capacity,
                capacity: decision.capacity,
                timestamp: self.clock.wall(),
            }));
        }
        Ok(decision)
    }

    async fn record(&self, trace: NewTrace) -> u64 {
        self.aggregator.observe(
            &trace.quota_id,
            Outcome::from_status(trace.status_code),
            trace.latency_ms,
        );
        self.recorder.record(trace).await
    }
}

fn default_cost() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AppConfig, LimiterConfig};
    use crate::quota::{Policy, TokenBucketConfig};
    use crate::trace::TraceFilter;

    struct Harness {
        gate: AdmissionGate,
        limiter: Arc<Limiter>,
        recorder: Arc<TraceRecorder>,
        aggregator: Arc<MetricsAggregator>,
    }

    fn harness() -> Harness {
        let config = AppConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let events = Arc::new(EventBroadcaster::new(&config.events));
        let limiter = Arc::new(Limiter::new(&LimiterConfig::default(), Arc::clone(&clock)));
        let recorder = Arc::new(TraceRecorder::new(
            &config.traces,
            config.scheduler.tz_offset,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let aggregator = Arc::new(MetricsAggregator::new(&config.metrics));
        let gate = AdmissionGate::new(
            Arc::clone(&limiter),
            Arc::clone(&recorder),
            Arc::clone(&aggregator),
            events,
            clock,
        );
        Harness { gate, limiter, recorder, aggregator }
    }

    fn install(h: &Harness, id: &str, capacity: f64, enabled: bool) {
        let policy = Policy::TokenBucket(TokenBucketConfig { capacity, refill_rate: 0.0, burst: 0.0 });
        h.limiter.install(id, policy, enabled);
        h.aggregator.track(id);
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay(0), Duration::from_millis(100));
        assert_eq!(retry.delay(3), Duration::from_millis(800));
        assert_eq!(retry.delay(6), Duration::from_secs(5));
        assert_eq!(retry.delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn acquire_traces_outcome_and_updates_metrics() {
        let h = harness();
        install(&h, "q", 1.0, true);

        let mut failing = AcquireRequest::new("q");
        failing.success = false;
        let first = h.gate.acquire(&failing).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.tokens_remain, 0.0);

        let second = h.gate.admit("q", 1).await.unwrap();
        assert!(!second.allowed);

        h.recorder.flush().await;
        let codes: Vec<u16> = h
            .recorder
            .query(10, &TraceFilter::default())
            .iter()
            .map(|t| t.status_code)
            .collect();
        assert_eq!(codes, vec![429, 500]);

        let current = h.aggregator.current();
        assert_eq!((current["q"].err, current["q"].r429), (1, 1));
        assert_eq!(current["q"].tokens_remain, Some(0.0));
    }

    #[tokio::test]
    async fn fault_is_kept_alongside_caller_message() {
        let h = harness();
        install(&h, "q", 5.0, true);

        let mut request = AcquireRequest::new("q");
        request.message = Some("batch 7".to_string());
        {
            let _held = h.limiter.hold_slot("q");
            assert!(!h.gate.acquire(&request).await.unwrap().allowed);
        }
        assert!(h.gate.acquire(&request).await.unwrap().allowed);

        h.recorder.flush().await;
        let traces = h.recorder.query(10, &TraceFilter::default());
        assert_eq!(traces[0].message.as_deref(), Some("batch 7"));
        assert_eq!(traces[1].status_code, 429);
        assert_eq!(
            traces[1].message.as_deref(),
            Some("batch 7; lock timeout, failing closed")
        );
    }

    #[tokio::test]
    async fn disabled_quota_is_still_traced() {
        let h = harness();
        install(&h, "q", 1.0, false);

        for _ in 0..3 {
            assert!(h.gate.admit("q", 1).await.unwrap().allowed);
        }
        h.recorder.flush().await;
        assert_eq!(h.recorder.len(), 3);
        assert_eq!(h.limiter.status("q").unwrap().level, 1.0);
    }

    #[tokio::test]
    async fn unknown_quota_and_zero_cost_are_errors() {
        let h = harness();
        assert!(matches!(h.gate.admit("nope", 1).await, Err(LimiterError::NotFound { .. })));

        install(&h, "q", 1.0, true);
        assert!(matches!(h.gate.admit("q", 0).await, Err(LimiterError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn guard_runs_and_traces_failures_without_refund() {
        let h = harness();
        install(&h, "q", 2.0, true);
        let call = GuardedCall::new("q").func("fetch", "fetch_quotes").retry(fast_retry(0));

        let value = h.gate.guard(&call, || async { Ok::<_, String>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = h
            .gate
            .guard(&call, || async { Err::<(), _>("upstream 503".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::DownstreamFailure(_)));
        assert_eq!(h.limiter.status("q").unwrap().level, 0.0);

        h.recorder.flush().await;
        let traces = h.recorder.query(10, &TraceFilter::default());
        assert_eq!(traces[0].status_code, 500);
        assert_eq!(traces[0].message.as_deref(), Some("upstream 503"));
        assert_eq!(traces[1].status_code, 200);
        assert!(traces[1].latency_ms.is_some());
    }

    #[tokio::test]
    async fn guard_gives_up_after_retries() {
        let h = harness();
        install(&h, "q", 1.0, true);
        h.gate.admit("q", 1).await.unwrap();

        let call = GuardedCall::new("q").retry(fast_retry(2));
        let err = h
            .gate
            .guard(&call, || async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Denied(_)));

        h.recorder.flush().await;
        let denied = TraceFilter { status_code: Some(429), ..Default::default() };
        assert_eq!(h.recorder.query(10, &denied).len(), 3);
    }
}
