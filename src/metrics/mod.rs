pub mod aggregator;
pub mod server;

pub use aggregator::{MetricSeriesPoint, MetricsAggregator, MetricsCurrent, Outcome};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, CounterVec, Gauge, HistogramVec, IntCounter,
    IntCounterVec, IntGauge,
};

lazy_static! {
    // Admission metrics
    pub static ref ADMISSIONS_TOTAL: CounterVec = register_counter_vec!(
        "quotad_admissions_total",
        "Total number of admission checks by outcome",
        &["quota_id", "outcome"]
    ).unwrap();

    pub static ref ADMISSION_DURATION: HistogramVec = register_histogram_vec!(
        "quotad_admission_duration_seconds",
        "Time spent deciding an admission, lock wait included",
        &["quota_id"],
        vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
    ).unwrap();

    pub static ref LOCK_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_lock_timeouts_total",
        "Admission checks answered by the failure policy",
        &["quota_id"]
    ).unwrap();

    // Trace metrics
    pub static ref TRACES_EVICTED_TOTAL: IntCounter = register_int_counter!(
        "quotad_traces_evicted_total",
        "Trace records evicted by the retention cap"
    ).unwrap();

    // Scheduler metrics
    pub static ref JOB_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotad_job_runs_total",
        "Scheduled job runs by result",
        &["job_id", "result"]
    ).unwrap();

    // Event stream metrics
    pub static ref EVENT_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "quotad_event_subscribers",
        "Connected event stream subscribers"
    ).unwrap();

    pub static ref EVENTS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "quotad_events_dropped_total",
        "Events skipped by lagging subscribers"
    ).unwrap();

    // Quota registry metrics
    pub static ref QUOTA_RELOADS_TOTAL: CounterVec = register_counter_vec!(
        "quotad_quota_reloads_total",
        "Total number of quota file reloads",
        &["result"]
    ).unwrap();

    pub static ref QUOTA_PERSIST_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "quotad_quota_persist_errors_total",
        "Failed writes of the quota file"
    ).unwrap();

    pub static ref ACTIVE_QUOTAS: Gauge = register_gauge!(
        "quotad_active_quotas",
        "Number of quotas configured"
    ).unwrap();
}

/// Record an admission check
pub fn record_admission(quota_id: &str, outcome: &str, duration_secs: f64) {
    ADMISSIONS_TOTAL
        .with_label_values(&[quota_id, outcome])
        .inc();

    ADMISSION_DURATION
        .with_label_values(&[quota_id])
        .observe(duration_secs);
}

pub fn record_lock_timeout(quota_id: &str) {
    LOCK_TIMEOUTS_TOTAL.with_label_values(&[quota_id]).inc();
}

pub fn record_traces_evicted(count: u64) {
    TRACES_EVICTED_TOTAL.inc_by(count);
}

/// Record a finished job run
pub fn record_job_run(job_id: &str, success: bool) {
    let result = if success { "success" } else { "error" };
    JOB_RUNS_TOTAL.with_label_values(&[job_id, result]).inc();
}

pub fn record_event_subscriber(connected: bool) {
    if connected {
        EVENT_SUBSCRIBERS.inc();
    } else {
        EVENT_SUBSCRIBERS.dec();
    }
}

pub fn record_events_dropped(count: u64) {
    EVENTS_DROPPED_TOTAL.inc_by(count);
}

/// Record quota file reload
pub fn record_quota_reload(success: bool) {
    let result = if success { "success" } else { "error" };
    QUOTA_RELOADS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_quota_persist_error() {
    QUOTA_PERSIST_ERRORS_TOTAL.inc();
}

/// Update registry size
pub fn update_quota_count(count: usize) {
    ACTIVE_QUOTAS.set(count as f64);
}
