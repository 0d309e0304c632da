//! Wiring of the service components and the quota/task management
//! operations the REST surface exposes.

use crate::admission::AdmissionGate;
use crate::clock::Clock;
use crate::config::loader::load_quota_file;
use crate::config::watcher::watch_quota_file;
use crate::config::AppConfig;
use crate::errors::{LimiterError, Result};
use crate::events::{EventBroadcaster, TokenLevel};
use crate::limiter::Limiter;
use crate::metrics::{self, MetricsAggregator};
use crate::quota::{JsonFileBackend, MemoryBackend, NewQuota, Quota, QuotaBackend, QuotaPatch, QuotaStore, QuotaView};
use crate::scheduler::jobs::{register_builtin, ExecutionLogJob};
use crate::scheduler::{Scheduler, Task, TaskSpec};
use crate::trace::TraceRecorder;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Body of `POST /tasks`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct App {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<QuotaStore>,
    pub limiter: Arc<Limiter>,
    pub recorder: Arc<TraceRecorder>,
    pub aggregator: Arc<MetricsAggregator>,
    pub events: Arc<EventBroadcaster>,
    pub gate: AdmissionGate,
    pub scheduler: Arc<Scheduler>,
    /// Serializes quota mutations together with their persistence
    admin: tokio::sync::Mutex<()>,
}

impl App {
    /// Build every component and load the stored quota definitions.
    ///
    /// Must run inside a Tokio runtime: the trace writer is spawned here.
    pub async fn build(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let events = Arc::new(EventBroadcaster::new(&config.events));
        let recorder = Arc::new(TraceRecorder::new(
            &config.traces,
            config.scheduler.tz_offset,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let aggregator = Arc::new(MetricsAggregator::new(&config.metrics));
        let limiter = Arc::new(Limiter::new(&config.limiter, Arc::clone(&clock)));

        let backend: Arc<dyn QuotaBackend> = match &config.quota_file {
            Some(path) => Arc::new(JsonFileBackend::new(path)),
            None => Arc::new(MemoryBackend),
        };
        let store = Arc::new(QuotaStore::new(backend));
        for quota in store.load().await? {
            limiter.install(&quota.id, quota.policy()?, quota.enabled);
            aggregator.track(&quota.id);
        }
        info!("Loaded {} quotas", store.len());

        let scheduler = Arc::new(Scheduler::new(
            &config.scheduler,
            Arc::clone(&recorder),
            Arc::clone(&aggregator),
            Arc::clone(&clock),
        ));
        register_builtin(
            &scheduler,
            Arc::clone(&store),
            Arc::clone(&aggregator),
            Arc::clone(&clock),
            config.scheduler.alerts.clone(),
        )?;

        let gate = AdmissionGate::new(
            Arc::clone(&limiter),
            Arc::clone(&recorder),
            Arc::clone(&aggregator),
            Arc::clone(&events),
            Arc::clone(&clock),
        );

        Ok(Arc::new(Self {
            config,
            clock,
            store,
            limiter,
            recorder,
            aggregator,
            events,
            gate,
            scheduler,
            admin: tokio::sync::Mutex::new(()),
        }))
    }

    /// Start the metric window roller, the scheduler timer and, when
    /// configured, the quota file watcher.
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let app = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(app.config.metrics.window);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                app.roll_metrics();
            }
        }));

        handles.push(Arc::clone(&self.scheduler).start());

        if self.config.watch_quota_file {
            if let Some(path) = self.store.watch_path() {
                let app = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    if let Err(e) = watch_quota_file(path, app).await {
                        error!("Quota file watcher stopped: {}", e);
                    }
                }));
            }
        }

        handles
    }

    /// Close the current metrics window for every quota.
    pub fn roll_metrics(&self) -> usize {
        self.aggregator.roll(self.clock.wall(), |quota_id| {
            self.limiter
                .status(quota_id)
                .ok()
                .map(|s| s.remaining_capacity)
        })
    }

    /// Live level of every enabled quota, as pushed to stream subscribers.
    pub fn token_levels(&self) -> Vec<TokenLevel> {
        let timestamp = self.clock.wall();
        self.store
            .list()
            .into_iter()
            .filter(|quota| quota.enabled)
            .filter_map(|quota| {
                let status = self.limiter.status(&quota.id).ok()?;
                Some(TokenLevel {
                    quota_id: quota.id,
                    tokens_remain: status.remaining_capacity,
                    capacity: status.capacity,
                    timestamp,
                })
            })
            .collect()
    }

    pub fn list_quotas(&self) -> Vec<QuotaView> {
        self.store
            .list()
            .into_iter()
            .map(|quota| self.view(quota))
            .collect()
    }

    pub fn get_quota(&self, id: &str) -> Result<QuotaView> {
        self.store
            .get(id)
            .map(|quota| self.view(quota))
            .ok_or_else(|| LimiterError::quota_not_found(id))
    }

    pub async fn create_quota(&self, new: NewQuota) -> Result<QuotaView> {
        let quota = new.into_quota(self.clock.wall());
        let policy = quota.policy()?;

        let _admin = self.admin.lock().await;
        self.store.insert(quota.clone())?;
        self.limiter.install(&quota.id, policy, quota.enabled);
        self.aggregator.track(&quota.id);
        self.store.persist().await;

        info!(quota_id = %quota.id, algo = %quota.algo, "Created quota");
        Ok(self.view(quota))
    }

    /// Patch an existing quota. The new parameters take effect for the very
    /// next admission; the current level is kept.
    pub async fn update_quota(&self, id: &str, patch: QuotaPatch) -> Result<QuotaView> {
        let _admin = self.admin.lock().await;
        let existing = self
            .store
            .get(id)
            .ok_or_else(|| LimiterError::quota_not_found(id))?;

        let updated = patch.apply_to(&existing, self.clock.wall());
        let policy = updated.policy()?;

        self.store.replace(updated.clone())?;
        self.limiter.configure(id, policy, updated.enabled)?;
        self.store.persist().await;

        info!(quota_id = id, "Updated quota");
        Ok(self.view(updated))
    }

    /// Flip `enabled`. Accumulated limiter state is untouched.
    pub async fn toggle_quota(&self, id: &str) -> Result<QuotaView> {
        let _admin = self.admin.lock().await;
        let mut quota = self
            .store
            .get(id)
            .ok_or_else(|| LimiterError::quota_not_found(id))?;

        quota.enabled = !quota.enabled;
        quota.updated_at = self.clock.wall();
        self.store.replace(quota.clone())?;
        self.limiter.set_enabled(id, quota.enabled)?;
        self.store.persist().await;

        info!(quota_id = id, enabled = quota.enabled, "Toggled quota");
        Ok(self.view(quota))
    }

    /// Remove a quota. In-flight admissions finish; later ones get NotFound.
    pub async fn delete_quota(&self, id: &str) -> Result<()> {
        let _admin = self.admin.lock().await;
        self.store
            .remove(id)
            .ok_or_else(|| LimiterError::quota_not_found(id))?;
        self.limiter.retire(id);
        self.aggregator.forget(id);
        self.store.persist().await;

        info!(quota_id = id, "Deleted quota");
        Ok(())
    }

    /// Re-read the quota file and apply what changed.
    pub async fn reload_quota_file(&self) -> Result<usize> {
        let Some(path) = self.store.watch_path() else {
            return Ok(0);
        };
        // Read under the admin lock so a reload never sees a file older
        // than the registry.
        let _admin = self.admin.lock().await;
        let quotas = load_quota_file(&path).await?;
        self.apply_quotas(quotas)
    }

    /// Create or update from externally supplied definitions. Quotas whose
    /// definition is unchanged are skipped so their level is untouched.
    fn apply_quotas(&self, quotas: Vec<Quota>) -> Result<usize> {
        // Validate everything before touching anything.
        let policies = quotas
            .iter()
            .map(Quota::policy)
            .collect::<Result<Vec<_>>>()?;

        let now = self.clock.wall();
        let mut applied = 0;
        for (mut quota, policy) in quotas.into_iter().zip(policies) {
            match self.store.get(&quota.id) {
                Some(existing) if same_definition(&existing, &quota) => continue,
                Some(existing) => {
                    quota.created_at = existing.created_at;
                    quota.updated_at = now;
                    self.store.replace(quota.clone())?;
                    self.limiter.install(&quota.id, policy, quota.enabled);
                }
                None => {
                    self.store.insert(quota.clone())?;
                    self.limiter.install(&quota.id, policy, quota.enabled);
                    self.aggregator.track(&quota.id);
                }
            }
            applied += 1;
        }

        metrics::update_quota_count(self.store.len());
        if applied > 0 {
            info!(applied, "Applied quota definitions from file");
        }
        Ok(applied)
    }

    pub fn create_task(&self, request: CreateTask) -> Result<Task> {
        let job_id = format!("task-{}", Uuid::new_v4());
        let spec = TaskSpec {
            job_id: job_id.clone(),
            name: request.name,
            cron: request.cron,
            description: request.description,
        };
        self.scheduler
            .register(spec, Arc::new(ExecutionLogJob::new(job_id)))
    }

    fn view(&self, quota: Quota) -> QuotaView {
        let current_tokens = self
            .limiter
            .status(&quota.id)
            .ok()
            .map(|s| s.remaining_capacity);
        QuotaView {
            quota,
            current_tokens,
        }
    }
}

/// Equal apart from the server-set timestamps.
fn same_definition(a: &Quota, b: &Quota) -> bool {
    let mut candidate = b.clone();
    candidate.created_at = a.created_at;
    candidate.updated_at = a.updated_at;
    *a == candidate
}
