//! Notify-based hot reload of the quota file.
//!
//! - Watches the file's parent directory, since saves usually replace the
//!   file with a rename.
//! - On create/modify events for the file, re-reads it and applies changed
//!   definitions through [`App::reload_quota_file`].

use crate::app::App;
use crate::errors::LimiterError;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the quota file for changes and reload it.
///
/// A file that fails to load or validate is logged and ignored; the
/// registry keeps its current definitions.
pub async fn watch_quota_file(path: PathBuf, app: Arc<App>) -> Result<(), notify::Error> {
    // Bridges the watcher's callback thread to this task.
    let (tx, mut rx) = mpsc::channel(16);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send quota file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    let dir = watch_dir(&path);
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching quota file for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event, &path) {
                    info!(
                        "Quota file change detected. Event: {:?}. Triggering reload.",
                        event.kind
                    );
                    reload(&path, &app).await;
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => {
                crate::metrics::record_quota_reload(false);
                error!("Error watching quota file: {}", e);
            }
        }
    }

    warn!("Quota file watcher task is shutting down.");
    Ok(())
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Creations and modifications of the watched file itself.
fn should_reload(event: &Event, path: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    );
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == path.file_name())
}

async fn reload(path: &Path, app: &App) {
    match app.reload_quota_file().await {
        Ok(applied) => {
            crate::metrics::record_quota_reload(true);
            info!("Quota file reloaded, {} definitions applied", applied);
        }
        Err(e) => {
            crate::metrics::record_quota_reload(false);
            match e {
                LimiterError::FileSystemError(io_err) => error!(
                    "Failed to read quota file '{}': {}. Keeping current quotas.",
                    path.display(),
                    io_err
                ),
                LimiterError::JsonError(json_err) => error!(
                    "Failed to parse JSON from '{}': {}. Keeping current quotas.",
                    path.display(),
                    json_err
                ),
                other => error!(
                    "Quota file '{}' rejected: {}. Keeping current quotas.",
                    path.display(),
                    other
                ),
            }
        }
    }
}
