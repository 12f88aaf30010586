//! Civic issue reporting gateway HTTP service.
//!
//! # Configuration
//!
//! - `GATEWAY_CONFIG` - Routing configuration TOML (default: /etc/civicgate/routing.toml)
//! - `SERVICE_PORT` - HTTP port (default: 8080)
//! - `DISPATCH_TIMEOUT_MS` - Per-backend deadline (default: 3000)
//! - `TELEMETRY_QUEUE` - Telemetry queue capacity (default: 1024)
//! - `REFRESH_DELAY_MS` - Delay before the startup catalog refresh (default: 0)
//! - `METRICS_ENABLED`, `METRICS_PATH` - Prometheus scrape endpoint
//! - `RUST_LOG` - Log level (default: info)
//! - `LOG_FORMAT` - Log format: json (default), text, or pretty

use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use tracing::{error, info};

use civicgate_service_gateway::{router, spawn_startup_refresh, spawn_telemetry_drain};
use civicgate_service_shared::{
    init_logging, init_metrics, AppState, GatewaySettings, LoggingConfig, MetricsConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging_config = LoggingConfig::from_env().with_service("gateway");
    init_logging(&logging_config);

    let metrics_config = MetricsConfig::from_env();
    if let Err(e) = init_metrics(&metrics_config) {
        tracing::warn!(error = %e, "failed to initialize metrics, continuing without metrics");
    }

    let settings = GatewaySettings::from_env();
    let port: u16 = env::var("SERVICE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    info!(
        config = %settings.config_path.display(),
        port,
        dispatch_timeout_ms = settings.dispatch_timeout.as_millis() as u64,
        "starting gateway service"
    );

    let (state, events) = AppState::load(&settings).map_err(|e| {
        error!(error = %e, path = %settings.config_path.display(), "failed to load application state");
        e
    })?;

    spawn_telemetry_drain(state.clone(), events);
    spawn_startup_refresh(state.clone(), settings.refresh_delay);

    let app = router(state, &metrics_config.path);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "listening on");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gateway service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
