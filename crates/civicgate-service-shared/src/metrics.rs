//! Prometheus metrics for civicgate services.
//!
//! - [`MetricsConfig`]: whether metrics are on and where they are served
//! - [`init_metrics`]: install the Prometheus recorder
//! - [`metrics_handler`]: axum handler for the scrape endpoint
//! - [`record_telemetry`]: turn core lifecycle events into counters
//!
//! # Example
//!
//! ```no_run
//! use civicgate_service_shared::metrics::{MetricsConfig, init_metrics, metrics_handler};
//! use axum::{Router, routing::get};
//!
//! let config = MetricsConfig::default();
//! init_metrics(&config).expect("failed to initialize metrics");
//!
//! let app: Router = Router::new().route("/metrics", get(metrics_handler));
//! ```

use civicgate_lib::{RpcScope, Status, TelemetryEvent};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Scrape path (e.g. "/metrics").
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Read configuration from the environment.
    ///
    /// - `METRICS_ENABLED`: anything but "false" enables (default: true)
    /// - `METRICS_PATH`: scrape path (default: "/metrics")
    pub fn from_env() -> Self {
        let enabled = std::env::var("METRICS_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);
        let path = std::env::var("METRICS_PATH").unwrap_or_else(|_| "/metrics".to_string());

        Self { enabled, path }
    }
}

/// Install the Prometheus recorder. Call once at startup.
///
/// # Errors
///
/// - [`MetricsError::Disabled`] when metrics are off.
/// - [`MetricsError::AlreadyInitialized`] on a second call.
/// - [`MetricsError::InstallFailed`] when the recorder cannot be installed.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Err(MetricsError::Disabled);
    }
    if PROMETHEUS_HANDLE.get().is_some() {
        return Err(MetricsError::AlreadyInitialized);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::InstallFailed(e.to_string()))?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::AlreadyInitialized)
}

/// Returns `None` until [`init_metrics`] succeeds.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Prometheus exposition text.
pub async fn metrics_handler() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_else(|| "# Metrics not initialized\n".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    Disabled,
    AlreadyInitialized,
    InstallFailed(String),
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::Disabled => write!(f, "metrics are disabled"),
            MetricsError::AlreadyInitialized => write!(f, "metrics recorder already initialized"),
            MetricsError::InstallFailed(e) => {
                write!(f, "failed to install metrics recorder: {}", e)
            }
        }
    }
}

impl std::error::Error for MetricsError {}

// =============================================================================
// Gateway metrics
// =============================================================================

/// Count a finished public request.
///
/// Increments `civicgate_requests_total{kind, status}`.
pub fn record_request(kind: &str, status: &str) {
    metrics::counter!(
        "civicgate_requests_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Count one finished call to an adapter.
///
/// Increments `civicgate_dispatch_calls_total{adapter, status}`.
pub fn record_dispatch_call(adapter: &str, status: &str) {
    metrics::counter!(
        "civicgate_dispatch_calls_total",
        "adapter" => adapter.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the merged result count of a dispatch.
pub fn record_dispatch_results(method: &str, results: usize) {
    metrics::histogram!(
        "civicgate_dispatch_results",
        "method" => method.to_string()
    )
    .record(results as f64);
}

/// Publish the telemetry queue's running drop count.
pub fn record_telemetry_dropped(total: u64) {
    metrics::counter!("civicgate_telemetry_dropped_total").absolute(total);
}

/// Map one lifecycle event onto the gateway metrics.
///
/// `open` events are not counted; only terminal states are.
pub fn record_telemetry(event: &TelemetryEvent) {
    match event {
        TelemetryEvent::Request(request) if request.status != Status::Open => {
            record_request(&request.kind.to_string(), &request.status.to_string());
        }
        TelemetryEvent::Rpc(rpc) if rpc.status != Status::Open => match rpc.scope {
            RpcScope::Target => {
                let adapter = rpc.route.split('.').next().unwrap_or(rpc.route.as_str());
                record_dispatch_call(adapter, &rpc.status.to_string());
            }
            RpcScope::Dispatch => record_dispatch_results(&rpc.method, rpc.results),
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use civicgate_lib::{RequestEvent, RequestKind, RpcEvent};

    #[test]
    fn test_metrics_config_default() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.path, "/metrics");
    }

    #[test]
    fn test_disabled_metrics_are_not_installed() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        assert_eq!(init_metrics(&config), Err(MetricsError::Disabled));
    }

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        let output = metrics_handler().await;
        assert!(
            output.contains('#') || output.is_empty(),
            "Metrics output should be Prometheus format or indicate not initialized"
        );
    }

    #[test]
    fn test_record_telemetry_accepts_every_event_shape() {
        let now = Utc::now();
        let rpc = |scope, status| {
            TelemetryEvent::Rpc(RpcEvent {
                request_id: 1,
                scope,
                status,
                method: "Report.SearchLL".to_string(),
                route: "CS1.SJ.3".to_string(),
                address: "http://127.0.0.1:5081/rpc".to_string(),
                results: 2,
                timestamp: now,
            })
        };
        record_telemetry(&rpc(RpcScope::Target, Status::Open));
        record_telemetry(&rpc(RpcScope::Target, Status::Done));
        record_telemetry(&rpc(RpcScope::Dispatch, Status::Done));
        record_telemetry(&TelemetryEvent::Request(RequestEvent {
            request_id: 1,
            kind: RequestKind::Search,
            status: Status::Error,
            area: None,
            failed_at: None,
            timestamp: now,
        }));
        record_telemetry_dropped(3);
    }

    #[test]
    fn test_metrics_error_display() {
        assert_eq!(MetricsError::Disabled.to_string(), "metrics are disabled");
        assert_eq!(
            MetricsError::AlreadyInitialized.to_string(),
            "metrics recorder already initialized"
        );
        let failed = MetricsError::InstallFailed("test error".to_string());
        assert!(failed.to_string().contains("test error"));
    }
}
