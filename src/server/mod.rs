pub mod observability;
pub mod quotas;
pub mod tasks;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::App;
use crate::config::ServerConfig;
use crate::errors::{LimiterError, Result};

/// Shared handler state
pub type AppState = Arc<App>;

/// Full REST/SSE surface.
pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/quotas", get(quotas::list).post(quotas::create))
        .route(
            "/quotas/{id}",
            get(quotas::get).put(quotas::update).delete(quotas::remove),
        )
        .route("/quotas/{id}/toggle", post(quotas::toggle))
        .route("/limiter/acquire", post(quotas::acquire))
        .route("/metrics/current", get(observability::metrics_current))
        .route("/metrics/series", get(observability::metrics_series))
        .route("/traces", get(observability::list_traces))
        .route("/traces/all", delete(observability::delete_all_traces))
        .route("/traces/old", delete(observability::delete_old_traces))
        .route("/traces/func-stats", get(observability::func_stats))
        .route("/events/stream", get(observability::event_stream))
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route("/tasks/trigger", post(tasks::trigger))
        .route("/tasks/{job_id}", delete(tasks::remove))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Serve the API until `shutdown` resolves.
pub async fn start_server<F>(config: &ServerConfig, app: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = config.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| LimiterError::InternalError(format!("Failed to bind {}: {}", addr, e)))?;

    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| LimiterError::InternalError(format!("Server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
