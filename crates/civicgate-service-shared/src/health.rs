//! Health check handlers for Kubernetes probes.
//!
//! `/health/live` answers as long as the process runs. `/health/ready` answers
//! 200 only once a non-empty service catalog generation has been published.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "ok" or "not_ready: <reason>".
    pub status: String,
    pub service: String,
    pub version: String,

    /// Published catalog generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,

    /// Services in the published generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_loaded: Option<usize>,
}

impl HealthStatus {
    pub fn alive(service: &str, version: &str) -> Self {
        Self {
            status: "ok".to_string(),
            service: service.to_string(),
            version: version.to_string(),
            generation: None,
            services_loaded: None,
        }
    }

    pub fn ready(service: &str, version: &str, generation: u64, services: usize) -> Self {
        Self {
            status: "ok".to_string(),
            service: service.to_string(),
            version: version.to_string(),
            generation: Some(generation),
            services_loaded: Some(services),
        }
    }

    pub fn not_ready(service: &str, version: &str, reason: &str) -> Self {
        Self {
            status: format!("not_ready: {}", reason),
            service: service.to_string(),
            version: version.to_string(),
            generation: None,
            services_loaded: None,
        }
    }
}

/// Liveness probe handler.
///
/// ```text
/// GET /health/live
/// {"status":"ok","service":"civicgate-service-shared","version":"0.1.0"}
/// ```
pub async fn health_live() -> impl IntoResponse {
    let status = HealthStatus::alive(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    (StatusCode::OK, Json(status))
}

/// Readiness probe handler.
///
/// ```text
/// GET /health/ready
/// {"status":"ok","service":"civicgate-service-shared","version":"0.1.0","generation":3,"services_loaded":8}
/// ```
pub async fn health_ready(State(state): State<AppState>) -> Response {
    let service = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");

    let snapshot = state.gateway().cache().snapshot();
    if snapshot.is_empty() {
        let status = HealthStatus::not_ready(service, version, "service catalog not loaded");
        return (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response();
    }

    let status = HealthStatus::ready(
        service,
        version,
        snapshot.number(),
        snapshot.service_count(),
    );
    (StatusCode::OK, Json(status)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{scripted_state, test_state};

    #[test]
    fn test_health_status_alive() {
        let status = HealthStatus::alive("test-service", "1.0.0");
        assert_eq!(status.status, "ok");
        assert!(status.generation.is_none());
        assert!(status.services_loaded.is_none());
    }

    #[test]
    fn test_health_status_not_ready() {
        let status = HealthStatus::not_ready("test-service", "1.0.0", "no data");
        assert!(status.status.starts_with("not_ready:"));
        assert!(status.status.contains("no data"));
    }

    #[test]
    fn test_health_status_serialization() {
        let json = serde_json::to_string(&HealthStatus::alive("gateway", "0.1.0")).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(!json.contains("services_loaded"));
    }

    #[tokio::test]
    async fn test_not_ready_before_first_refresh() {
        let (state, _, _) = test_state();
        let response = health_ready(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_after_refresh() {
        let (state, _, _) = scripted_state();
        state.gateway().refresh().await.unwrap();
        let response = health_ready(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
