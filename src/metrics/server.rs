use crate::errors::{LimiterError, Result};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Serve the Prometheus text exposition on its own port.
pub async fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        LimiterError::InternalError(format!("Failed to bind metrics server: {}", e))
    })?;

    info!("Metrics server listening on http://0.0.0.0:{}/metrics", port);

    axum::serve(listener, router())
        .await
        .map_err(|e| LimiterError::InternalError(format!("Metrics server failed: {}", e)))
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(exposition))
        .route("/", get(exposition))
}

async fn exposition() -> impl IntoResponse {
    match gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn gather_metrics() -> std::result::Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
}
