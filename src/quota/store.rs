use crate::config::loader::{load_quota_file, write_quota_file};
use crate::errors::{LimiterError, Result};
use crate::metrics;
use crate::quota::Quota;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Durable side of the quota registry.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Load every stored definition
    async fn load(&self) -> Result<Vec<Quota>>;

    /// Replace the stored definitions with `quotas`
    async fn persist(&self, quotas: &[Quota]) -> Result<()>;

    /// File to watch for external edits, if any
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// Keeps nothing across restarts.
#[derive(Debug, Default)]
pub struct MemoryBackend;

#[async_trait]
impl QuotaBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<Quota>> {
        Ok(Vec::new())
    }

    async fn persist(&self, _quotas: &[Quota]) -> Result<()> {
        Ok(())
    }
}

/// Stores definitions as a JSON array in one file.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QuotaBackend for JsonFileBackend {
    async fn load(&self) -> Result<Vec<Quota>> {
        match load_quota_file(&self.path).await {
            Ok(quotas) => Ok(quotas),
            Err(LimiterError::FileSystemError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Quota file {} does not exist yet, starting empty",
                    self.path.display()
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, quotas: &[Quota]) -> Result<()> {
        write_quota_file(&self.path, quotas).await
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Registry of quota definitions keyed by id.
///
/// Reads are served from memory. Every mutation is followed by
/// [`QuotaStore::persist`], which writes a full snapshot so a failed write is
/// repaired by the next successful one.
pub struct QuotaStore {
    quotas: DashMap<String, Quota>,
    backend: Arc<dyn QuotaBackend>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl QuotaStore {
    pub fn new(backend: Arc<dyn QuotaBackend>) -> Self {
        Self {
            quotas: DashMap::new(),
            backend,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend))
    }

    /// Populate the registry from the backend.
    pub async fn load(&self) -> Result<Vec<Quota>> {
        let quotas = self.backend.load().await?;
        for quota in &quotas {
            self.quotas.insert(quota.id.clone(), quota.clone());
        }
        metrics::update_quota_count(self.quotas.len());
        Ok(quotas)
    }

    pub fn get(&self, id: &str) -> Option<Quota> {
        self.quotas.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.quotas.contains_key(id)
    }

    /// All definitions ordered by id
    pub fn list(&self) -> Vec<Quota> {
        let mut quotas: Vec<Quota> = self.quotas.iter().map(|e| e.value().clone()).collect();
        quotas.sort_by(|a, b| a.id.cmp(&b.id));
        quotas
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    /// Add a new definition; fails if the id is taken.
    pub fn insert(&self, quota: Quota) -> Result<()> {
        match self.quotas.entry(quota.id.clone()) {
            Entry::Occupied(_) => Err(LimiterError::AlreadyExists {
                kind: "Quota",
                id: quota.id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(quota);
                metrics::update_quota_count(self.quotas.len());
                Ok(())
            }
        }
    }

    /// Replace an existing definition.
    pub fn replace(&self, quota: Quota) -> Result<()> {
        match self.quotas.get_mut(&quota.id) {
            Some(mut entry) => {
                *entry = quota;
                Ok(())
            }
            None => Err(LimiterError::quota_not_found(quota.id)),
        }
    }

    pub fn remove(&self, id: &str) -> Option<Quota> {
        let removed = self.quotas.remove(id).map(|(_, quota)| quota);
        metrics::update_quota_count(self.quotas.len());
        removed
    }

    /// Write the current registry to the backend.
    ///
    /// Failures are logged and counted, never returned: the in-memory
    /// registry stays authoritative and the next persist retries.
    pub async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.list();
        if let Err(e) = self.backend.persist(&snapshot).await {
            metrics::record_quota_persist_error();
            error!("Failed to persist {} quota definitions: {}", snapshot.len(), e);
        }
    }

    pub fn watch_path(&self) -> Option<PathBuf> {
        self.backend.watch_path().map(Path::to_path_buf)
    }
}
