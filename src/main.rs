use quotad::config::validator::validate_config;
use quotad::metrics::server::start_metrics_server;
use quotad::{start_server, App, AppConfig, SystemClock};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotad=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quota Service Starting...");

    // Load configuration from environment
    let config = AppConfig::from_env();
    validate_config(&config)?;

    tracing::info!("Server will listen on: {}", config.server.addr());
    if let Some(path) = &config.quota_file {
        tracing::info!("Quota definitions file: {}", path.display());
    }

    let server_config = config.server.clone();
    let metrics_port = config.metrics_port;

    let app = App::build(config, Arc::new(SystemClock)).await?;
    let background = app.start_background();

    if metrics_port != 0 {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    start_server(&server_config, app, shutdown_signal()).await?;

    for handle in background {
        handle.abort();
    }
    tracing::info!("Quota Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
