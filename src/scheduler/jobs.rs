//! Built-in maintenance jobs and the body of user-created tasks.

use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::errors::Result;
use crate::metrics::MetricsAggregator;
use crate::quota::QuotaStore;
use crate::scheduler::{Job, Scheduler, TaskSpec};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub const HEALTH_CHECK_JOB_ID: &str = "health_check";
pub const WINDOW_RESET_JOB_ID: &str = "window_reset";

/// Series history kept by the nightly reset.
const SERIES_RETENTION_DAYS: i64 = 7;

/// Body of tasks created through the API: the run itself is the record.
pub struct ExecutionLogJob {
    job_id: String,
}

impl ExecutionLogJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self { job_id: job_id.into() }
    }
}

#[async_trait]
impl Job for ExecutionLogJob {
    async fn run(&self) -> Result<Option<String>> {
        info!(job_id = %self.job_id, "Executed job");
        Ok(Some(format!("Executed job {}", self.job_id)))
    }
}

/// Warns about enabled quotas whose recent error or 429 rate is too high.
pub struct HealthCheckJob {
    store: Arc<QuotaStore>,
    aggregator: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    alerts: AlertConfig,
}

impl HealthCheckJob {
    pub fn new(
        store: Arc<QuotaStore>,
        aggregator: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
        alerts: AlertConfig,
    ) -> Self {
        Self {
            store,
            aggregator,
            clock,
            alerts,
        }
    }
}

#[async_trait]
impl Job for HealthCheckJob {
    async fn run(&self) -> Result<Option<String>> {
        let window = chrono::Duration::from_std(self.alerts.window)
            .unwrap_or_else(|_| chrono::Duration::minutes(3));
        let since = self.clock.wall() - window;

        let mut checked = 0;
        let mut alerts = 0;
        for quota in self.store.list().into_iter().filter(|q| q.enabled) {
            checked += 1;
            let totals = self.aggregator.totals_since(&quota.id, since);
            let total = totals.total();
            if total == 0 {
                continue;
            }

            let error_rate = totals.err as f64 / total as f64;
            let rate_429 = totals.r429 as f64 / total as f64;
            if error_rate > self.alerts.error_rate {
                alerts += 1;
                warn!(quota_id = %quota.id, error_rate, total, "High error rate");
            }
            if rate_429 > self.alerts.rate_429 {
                alerts += 1;
                warn!(quota_id = %quota.id, rate_429, total, "High 429 rate");
            }
        }

        Ok(Some(format!("Checked {} quotas, {} alerts", checked, alerts)))
    }
}

/// Prunes old series points and zeroes the cumulative counters.
pub struct WindowResetJob {
    aggregator: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
}

impl WindowResetJob {
    pub fn new(aggregator: Arc<MetricsAggregator>, clock: Arc<dyn Clock>) -> Self {
        Self { aggregator, clock }
    }
}

#[async_trait]
impl Job for WindowResetJob {
    async fn run(&self) -> Result<Option<String>> {
        let cutoff = self.clock.wall() - chrono::Duration::days(SERIES_RETENTION_DAYS);
        let pruned = self.aggregator.prune_series_before(cutoff);
        self.aggregator.reset();
        info!(pruned, "Reset metric windows");
        Ok(Some(format!("Pruned {} series points and reset counters", pruned)))
    }
}

/// Register the maintenance jobs every instance runs.
pub fn register_builtin(
    scheduler: &Scheduler,
    store: Arc<QuotaStore>,
    aggregator: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    alerts: AlertConfig,
) -> Result<()> {
    scheduler.register(
        TaskSpec {
            job_id: HEALTH_CHECK_JOB_ID.to_string(),
            name: "Quota health check".to_string(),
            cron: "*/3 * * * *".to_string(),
            description: Some("Warn when a quota's error or 429 rate is too high".to_string()),
        },
        Arc::new(HealthCheckJob::new(
            store,
            Arc::clone(&aggregator),
            Arc::clone(&clock),
            alerts,
        )),
    )?;

    scheduler.register(
        TaskSpec {
            job_id: WINDOW_RESET_JOB_ID.to_string(),
            name: "Metric window reset".to_string(),
            cron: "0 3 * * *".to_string(),
            description: Some("Drop week-old series points and reset counters".to_string()),
        },
        Arc::new(WindowResetJob::new(aggregator, clock)),
    )?;
    Ok(())
}
