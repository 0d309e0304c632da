pub mod cron;
pub mod jobs;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::errors::{LimiterError, Result};
use crate::metrics::{self, MetricsAggregator, Outcome};
use crate::trace::{NewTrace, TraceRecorder};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use cron::CronSchedule;

/// Quota id that job runs are traced under.
pub const SYSTEM_QUOTA_ID: &str = "system";

/// Work the scheduler can run.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run once. The returned text, if any, becomes the trace message.
    async fn run(&self) -> Result<Option<String>>;
}

/// Registration data for a job.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub job_id: String,
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Read model served by `GET /tasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub job_id: String,
    pub name: String,
    pub cron: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A run was handed to a worker
    Scheduled,
    /// A run was already in flight; nothing was started
    AlreadyRunning,
}

struct Registration {
    seq: u64,
    spec: TaskSpec,
    schedule: CronSchedule,
    job: Arc<dyn Job>,
    running: AtomicBool,
    next_fire: Mutex<Option<DateTime<Utc>>>,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
}

/// Cron-driven job runner that also accepts on-demand triggers.
///
/// Runs execute on spawned tasks and each job has at most one run in
/// flight; a fire or trigger that finds it busy is skipped. Every run ends
/// in a trace on [`SYSTEM_QUOTA_ID`], 200 on success and 500 on error or
/// panic, and is counted in the aggregator under the same id.
pub struct Scheduler {
    entries: DashMap<String, Arc<Registration>>,
    seq: AtomicU64,
    recorder: Arc<TraceRecorder>,
    aggregator: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    tz_offset: FixedOffset,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        recorder: Arc<TraceRecorder>,
        aggregator: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        aggregator.track(SYSTEM_QUOTA_ID);
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
            recorder,
            aggregator,
            clock,
            tz_offset: config.tz_offset,
            tick: config.tick,
        }
    }

    pub fn register(&self, spec: TaskSpec, job: Arc<dyn Job>) -> Result<Task> {
        if spec.job_id.trim().is_empty() {
            return Err(LimiterError::InvalidConfig("job_id must not be empty".into()));
        }
        let schedule = CronSchedule::parse(&spec.cron)?;
        let now = self.clock.wall();

        let registration = Arc::new(Registration {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            next_fire: Mutex::new(schedule.next_after(now, self.tz_offset)),
            spec,
            schedule,
            job,
            running: AtomicBool::new(false),
            last_run_at: Mutex::new(None),
        });

        match self.entries.entry(registration.spec.job_id.clone()) {
            MapEntry::Occupied(_) => Err(LimiterError::AlreadyExists {
                kind: "Task",
                id: registration.spec.job_id.clone(),
            }),
            MapEntry::Vacant(slot) => {
                info!(
                    job_id = %registration.spec.job_id,
                    cron = %registration.schedule,
                    "Registered job"
                );
                let task = self.view(&registration, now);
                slot.insert(registration);
                Ok(task)
            }
        }
    }

    /// Start a run now, independent of the schedule. Returns once the run
    /// has been handed off.
    pub fn trigger(&self, job_id: &str) -> Result<TriggerOutcome> {
        let registration = self
            .entries
            .get(job_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| LimiterError::task_not_found(job_id))?;
        Ok(self.dispatch(registration))
    }

    /// Remove a job. A run already in flight is left to finish.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        match self.entries.remove(job_id) {
            Some(_) => {
                info!(job_id, "Deleted job");
                Ok(())
            }
            None => Err(LimiterError::task_not_found(job_id)),
        }
    }

    /// Registered jobs in registration order with `next_run` computed from
    /// the current time.
    pub fn list(&self) -> Vec<Task> {
        let now = self.clock.wall();
        let mut registrations: Vec<Arc<Registration>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        registrations.sort_by_key(|r| r.seq);
        registrations.iter().map(|r| self.view(r, now)).collect()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.entries
            .get(job_id)
            .is_some_and(|e| e.value().running.load(Ordering::Acquire))
    }

    /// Fire every job whose time has come. Returns how many were due.
    pub fn tick_once(&self) -> usize {
        let now = self.clock.wall();
        let due: Vec<Arc<Registration>> = self
            .entries
            .iter()
            .filter(|e| e.value().next_fire.lock().is_some_and(|at| at <= now))
            .map(|e| Arc::clone(e.value()))
            .collect();

        for registration in &due {
            *registration.next_fire.lock() = registration.schedule.next_after(now, self.tz_offset);
            debug!(job_id = %registration.spec.job_id, "Job due");
            self.dispatch(Arc::clone(registration));
        }
        due.len()
    }

    /// Drive the timer until the runtime shuts down.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(tick = ?self.tick, "Scheduler started");
            loop {
                interval.tick().await;
                self.tick_once();
            }
        })
    }

    fn view(&self, registration: &Registration, now: DateTime<Utc>) -> Task {
        Task {
            job_id: registration.spec.job_id.clone(),
            name: registration.spec.name.clone(),
            cron: Some(registration.schedule.to_string()),
            description: registration.spec.description.clone(),
            is_active: true,
            next_run: registration.schedule.next_after(now, self.tz_offset),
            last_run_at: *registration.last_run_at.lock(),
        }
    }

    fn dispatch(&self, registration: Arc<Registration>) -> TriggerOutcome {
        if registration
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(job_id = %registration.spec.job_id, "Job is still running, skipping this run");
            return TriggerOutcome::AlreadyRunning;
        }

        let recorder = Arc::clone(&self.recorder);
        let aggregator = Arc::clone(&self.aggregator);
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            let job_id = registration.spec.job_id.clone();
            let started = Instant::now();

            // Run on its own task so a panic surfaces as a JoinError here.
            let job = Arc::clone(&registration.job);
            let joined = tokio::spawn(async move { job.run().await }).await;

            let (status_code, message) = match joined {
                Ok(Ok(summary)) => (200, summary.unwrap_or_else(|| format!("Executed job {}", job_id))),
                Ok(Err(e)) => {
                    error!(job_id = %job_id, error = %e, "Job failed");
                    (500, e.to_string())
                }
                Err(join_err) => {
                    error!(job_id = %job_id, error = %join_err, "Job panicked");
                    (500, format!("job panicked: {}", join_err))
                }
            };

            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            *registration.last_run_at.lock() = Some(clock.wall());
            metrics::record_job_run(&job_id, status_code == 200);
            aggregator.observe(SYSTEM_QUOTA_ID, Outcome::from_status(status_code), Some(latency_ms));
            recorder
                .record(
                    NewTrace::new(SYSTEM_QUOTA_ID, status_code)
                        .func(Some(job_id.clone()), Some(registration.spec.name.clone()))
                        .latency_ms(Some(latency_ms))
                        .message(message),
                )
                .await;

            registration.running.store(false, Ordering::Release);
            debug!(job_id = %job_id, status_code, "Job run finished");
        });

        TriggerOutcome::Scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AppConfig, EventConfig};
    use crate::events::EventBroadcaster;
    use crate::trace::TraceFilter;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn run(&self) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct Failing;

    #[async_trait]
    impl Job for Failing {
        async fn run(&self) -> Result<Option<String>> {
            Err(LimiterError::JobFailed("disk full".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Job for Panicking {
        async fn run(&self) -> Result<Option<String>> {
            panic!("boom")
        }
    }

    fn spec(job_id: &str, cron: &str) -> TaskSpec {
        TaskSpec {
            job_id: job_id.into(),
            name: format!("{job_id} job"),
            cron: cron.into(),
            description: None,
        }
    }

    fn scheduler(clock: Arc<ManualClock>) -> (Scheduler, Arc<TraceRecorder>) {
        let (scheduler, recorder, _) = scheduler_with_metrics(clock);
        (scheduler, recorder)
    }

    fn scheduler_with_metrics(
        clock: Arc<ManualClock>,
    ) -> (Scheduler, Arc<TraceRecorder>, Arc<MetricsAggregator>) {
        let config = AppConfig::default();
        let recorder = Arc::new(TraceRecorder::new(
            &config.traces,
            config.scheduler.tz_offset,
            clock.clone(),
            Arc::new(EventBroadcaster::new(&EventConfig::default())),
        ));
        let aggregator = Arc::new(MetricsAggregator::new(&config.metrics));
        let scheduler = Scheduler::new(
            &config.scheduler,
            Arc::clone(&recorder),
            Arc::clone(&aggregator),
            clock,
        );
        (scheduler, recorder, aggregator)
    }

    async fn wait_idle(scheduler: &Scheduler, job_id: &str) {
        for _ in 0..200 {
            if !scheduler.is_running(job_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never finished");
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_bad_cron() {
        let (scheduler, _) = scheduler(Arc::new(ManualClock::new()));
        scheduler.register(spec("a", "* * * * *"), Arc::new(Noop)).unwrap();

        assert!(matches!(
            scheduler.register(spec("a", "* * * * *"), Arc::new(Noop)),
            Err(LimiterError::AlreadyExists { .. })
        ));
        assert!(matches!(
            scheduler.register(spec("b", "not cron"), Arc::new(Noop)),
            Err(LimiterError::InvalidCron { .. })
        ));
    }

    #[tokio::test]
    async fn list_recomputes_next_run_in_registration_order() {
        let clock = Arc::new(ManualClock::new());
        let (scheduler, _) = scheduler(clock.clone());
        scheduler.register(spec("z", "*/5 * * * *"), Arc::new(Noop)).unwrap();
        scheduler.register(spec("a", "@hourly"), Arc::new(Noop)).unwrap();

        let first = scheduler.list();
        assert_eq!(first.iter().map(|t| t.job_id.as_str()).collect::<Vec<_>>(), vec!["z", "a"]);

        clock.advance(Duration::from_secs(3600));
        let later = scheduler.list();
        assert!(later[1].next_run > first[1].next_run);
        assert!(later.iter().all(|t| t.is_active));
    }

    #[tokio::test]
    async fn runs_are_traced_on_the_system_quota() {
        let (scheduler, recorder) = scheduler(Arc::new(ManualClock::new()));
        scheduler.register(spec("ok", "@daily"), Arc::new(Noop)).unwrap();
        scheduler.register(spec("bad", "@daily"), Arc::new(Failing)).unwrap();
        scheduler.register(spec("boom", "@daily"), Arc::new(Panicking)).unwrap();

        for id in ["ok", "bad", "boom"] {
            assert_eq!(scheduler.trigger(id).unwrap(), TriggerOutcome::Scheduled);
            wait_idle(&scheduler, id).await;
        }
        recorder.flush().await;

        let traces = recorder.query(10, &TraceFilter::default());
        let by_job = |id: &str| traces.iter().find(|t| t.func_id.as_deref() == Some(id)).unwrap();
        assert_eq!(by_job("ok").status_code, 200);
        assert_eq!(by_job("ok").message.as_deref(), Some("Executed job ok"));
        assert_eq!(by_job("bad").status_code, 500);
        assert_eq!(by_job("boom").status_code, 500);
        assert!(traces.iter().all(|t| t.quota_id == SYSTEM_QUOTA_ID));

        assert!(scheduler.list().iter().all(|t| t.last_run_at.is_some()));
    }

    #[tokio::test]
    async fn runs_are_counted_on_the_system_quota() {
        let (scheduler, _, aggregator) = scheduler_with_metrics(Arc::new(ManualClock::new()));
        assert_eq!(aggregator.current()[SYSTEM_QUOTA_ID].ok, 0);

        scheduler.register(spec("ok", "@daily"), Arc::new(Noop)).unwrap();
        scheduler.register(spec("bad", "@daily"), Arc::new(Failing)).unwrap();
        scheduler.register(spec("boom", "@daily"), Arc::new(Panicking)).unwrap();
        for id in ["ok", "bad", "boom", "ok"] {
            scheduler.trigger(id).unwrap();
            wait_idle(&scheduler, id).await;
        }

        let system = &aggregator.current()[SYSTEM_QUOTA_ID];
        assert_eq!((system.ok, system.err, system.r429), (2, 2, 0));

        aggregator.roll(chrono::Utc::now(), |_| None);
        let series = aggregator.series(Some(SYSTEM_QUOTA_ID), 1);
        assert_eq!((series[0].ok, series[0].err), (2, 2));
        assert!(series[0].latency_p95.is_some());
    }

    #[tokio::test]
    async fn tick_fires_due_jobs_once() {
        let clock = Arc::new(ManualClock::new());
        let (scheduler, recorder) = scheduler(clock.clone());
        scheduler.register(spec("every", "* * * * *"), Arc::new(Noop)).unwrap();

        assert_eq!(scheduler.tick_once(), 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(scheduler.tick_once(), 1);
        wait_idle(&scheduler, "every").await;
        assert_eq!(scheduler.tick_once(), 0);

        recorder.flush().await;
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_deleted_jobs_are_not_found() {
        let (scheduler, _) = scheduler(Arc::new(ManualClock::new()));
        assert!(matches!(scheduler.trigger("nope"), Err(LimiterError::NotFound { .. })));

        scheduler.register(spec("a", "@daily"), Arc::new(Noop)).unwrap();
        scheduler.delete("a").unwrap();
        assert!(matches!(scheduler.trigger("a"), Err(LimiterError::NotFound { .. })));
        assert!(matches!(scheduler.delete("a"), Err(LimiterError::NotFound { .. })));
        assert!(scheduler.list().is_empty());
    }
}
