pub mod func_stats;

use crate::clock::Clock;
use crate::config::TraceConfig;
use crate::events::{Event, EventBroadcaster};
use crate::metrics;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use func_stats::{func_stats, FuncStats};

/// One admission decision or job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: u64,
    pub quota_id: String,
    pub func_id: Option<String>,
    pub func_name: Option<String>,
    /// 200 admitted and succeeded, 429 denied, 5xx admitted but failed
    pub status_code: u16,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Trace fields supplied by the caller; id and timestamp are assigned on record.
#[derive(Debug, Clone, Default)]
pub struct NewTrace {
    pub quota_id: String,
    pub func_id: Option<String>,
    pub func_name: Option<String>,
    pub status_code: u16,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl NewTrace {
    pub fn new(quota_id: impl Into<String>, status_code: u16) -> Self {
        Self {
            quota_id: quota_id.into(),
            status_code,
            ..Default::default()
        }
    }

    pub fn func(mut self, func_id: Option<String>, func_name: Option<String>) -> Self {
        self.func_id = func_id;
        self.func_name = func_name;
        self
    }

    pub fn latency_ms(mut self, latency_ms: Option<f64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Query filters; `None` matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceFilter {
    pub quota_id: Option<String>,
    pub func_id: Option<String>,
    pub status_code: Option<u16>,
}

impl TraceFilter {
    fn matches(&self, trace: &Trace) -> bool {
        self.quota_id.as_ref().map_or(true, |q| *q == trace.quota_id)
            && self.func_id.as_ref().map_or(true, |f| trace.func_id.as_ref() == Some(f))
            && self.status_code.map_or(true, |s| s == trace.status_code)
    }
}

enum Command {
    Append(Trace),
    Flush(oneshot::Sender<()>),
}

/// Records held in id order.
struct TraceLog {
    records: RwLock<BTreeMap<u64, Trace>>,
    max_records: usize,
}

impl TraceLog {
    fn insert(&self, trace: Trace) {
        let evicted = {
            let mut records = self.records.write();
            records.insert(trace.id, trace);
            let mut evicted = 0u64;
            if self.max_records > 0 {
                while records.len() > self.max_records {
                    records.pop_first();
                    evicted += 1;
                }
            }
            evicted
        };
        if evicted > 0 {
            metrics::record_traces_evicted(evicted);
        }
    }
}

/// Append-only log of admission decisions.
///
/// [`TraceRecorder::record`] assigns the id immediately and queues the
/// record for a writer task, which stores it and publishes it to the event
/// stream. The queue is bounded: a full queue makes producers wait, nothing
/// is dropped.
pub struct TraceRecorder {
    next_id: AtomicU64,
    log: Arc<TraceLog>,
    events: Arc<EventBroadcaster>,
    tx: mpsc::Sender<Command>,
    clock: Arc<dyn Clock>,
    tz_offset: FixedOffset,
}

impl TraceRecorder {
    /// Create the recorder and spawn its writer task on the current runtime.
    pub fn new(
        config: &TraceConfig,
        tz_offset: FixedOffset,
        clock: Arc<dyn Clock>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let log = Arc::new(TraceLog {
            records: RwLock::new(BTreeMap::new()),
            max_records: config.max_records,
        });

        tokio::spawn(run_writer(rx, Arc::clone(&log), Arc::clone(&events)));

        Self {
            next_id: AtomicU64::new(1),
            log,
            events,
            tx,
            clock,
            tz_offset,
        }
    }

    pub async fn record(&self, new: NewTrace) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let trace = Trace {
            id,
            quota_id: new.quota_id,
            func_id: new.func_id,
            func_name: new.func_name,
            status_code: new.status_code,
            latency_ms: new.latency_ms,
            message: new.message,
            created_at: self.clock.wall(),
        };

        if let Err(mpsc::error::SendError(Command::Append(trace))) =
            self.tx.send(Command::Append(trace)).await
        {
            warn!(trace_id = id, "Trace writer is gone, storing inline");
            self.log.insert(trace.clone());
            self.events.publish(Event::Trace(trace));
        }
        id
    }

    /// Wait until every record queued before this call is queryable.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Newest first, at most `limit` records.
    pub fn query(&self, limit: usize, filter: &TraceFilter) -> Vec<Trace> {
        self.log
            .records
            .read()
            .values()
            .rev()
            .filter(|t| filter.matches(t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every stored record in id order.
    pub fn snapshot(&self) -> Vec<Trace> {
        self.log.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn delete_all(&self) -> usize {
        self.flush().await;
        let deleted = {
            let mut records = self.log.records.write();
            let n = records.len();
            records.clear();
            n
        };
        info!(deleted, "Deleted all traces");
        deleted
    }

    /// Delete everything created before local midnight of the current day.
    pub async fn delete_older_than_today(&self) -> usize {
        self.flush().await;
        let cutoff = start_of_day(self.clock.wall(), self.tz_offset);
        let deleted = {
            let mut records = self.log.records.write();
            let before = records.len();
            records.retain(|_, t| t.created_at >= cutoff);
            before - records.len()
        };
        info!(deleted, %cutoff, "Deleted traces older than today");
        deleted
    }
}

/// UTC instant of midnight, in `offset`, of the day containing `now`.
pub fn start_of_day(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = now.with_timezone(&offset).date_naive().and_time(NaiveTime::MIN);
    let utc_naive = local_midnight - chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc_naive)
}

async fn run_writer(
    mut rx: mpsc::Receiver<Command>,
    log: Arc<TraceLog>,
    events: Arc<EventBroadcaster>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Append(trace) => {
                log.insert(trace.clone());
                events.publish(Event::Trace(trace));
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Trace writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EventConfig;
    use std::time::Duration;

    fn recorder(clock: Arc<ManualClock>, max_records: usize) -> TraceRecorder {
        TraceRecorder::new(
            &TraceConfig { queue_capacity: 4, max_records },
            FixedOffset::east_opt(8 * 3600).unwrap(),
            clock,
            Arc::new(EventBroadcaster::new(&EventConfig::default())),
        )
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_query_is_newest_first() {
        let recorder = recorder(Arc::new(ManualClock::new()), 0);
        let first = recorder.record(NewTrace::new("a", 200)).await;
        let second = recorder.record(NewTrace::new("b", 429)).await;
        let third = recorder.record(NewTrace::new("a", 500)).await;
        assert!(first < second && second < third);

        recorder.flush().await;
        let ids: Vec<u64> = recorder.query(10, &TraceFilter::default()).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![third, second, first]);
    }

    #[tokio::test]
    async fn filters_combine() {
        let recorder = recorder(Arc::new(ManualClock::new()), 0);
        recorder
            .record(NewTrace::new("a", 200).func(Some("f1".into()), None))
            .await;
        recorder
            .record(NewTrace::new("a", 429).func(Some("f1".into()), None))
            .await;
        recorder.record(NewTrace::new("b", 429)).await;
        recorder.flush().await;

        let filter = TraceFilter {
            quota_id: Some("a".into()),
            func_id: Some("f1".into()),
            status_code: Some(429),
        };
        let hits = recorder.query(10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status_code, 429);

        let limited = TraceFilter { status_code: Some(429), ..Default::default() };
        assert_eq!(recorder.query(1, &limited).len(), 1);
    }

    #[tokio::test]
    async fn producers_wait_rather_than_drop() {
        let recorder = Arc::new(recorder(Arc::new(ManualClock::new()), 0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let recorder = Arc::clone(&recorder);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    recorder.record(NewTrace::new(format!("q{i}"), 200)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        recorder.flush().await;
        assert_eq!(recorder.len(), 200);
    }

    #[tokio::test]
    async fn retention_cap_evicts_oldest() {
        let recorder = recorder(Arc::new(ManualClock::new()), 3);
        for _ in 0..5 {
            recorder.record(NewTrace::new("q", 200)).await;
        }
        recorder.flush().await;

        let ids: Vec<u64> = recorder.snapshot().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn delete_older_than_today_keeps_todays_records() {
        // 2024-03-01 15:00 UTC is 23:00 in +08:00
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::starting_at(start));
        let recorder = recorder(clock.clone(), 0);

        recorder.record(NewTrace::new("q", 200)).await;
        recorder.record(NewTrace::new("q", 429)).await;

        // Two hours later it is already the next local day.
        clock.advance(Duration::from_secs(2 * 3600));
        recorder.record(NewTrace::new("q", 200)).await;

        assert_eq!(recorder.delete_older_than_today().await, 2);
        assert_eq!(recorder.len(), 1);

        assert_eq!(recorder.delete_all().await, 1);
        assert!(recorder.query(10, &TraceFilter::default()).is_empty());
    }

    #[test]
    fn start_of_day_respects_offset() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 17, 30, 0).unwrap();
        assert_eq!(
            start_of_day(now, offset),
            Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap()
        );
    }
}
