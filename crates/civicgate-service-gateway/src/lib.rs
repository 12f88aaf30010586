//! Public HTTP front door of the civic issue reporting gateway.
//!
//! # Endpoints
//!
//! - `POST /api/v1/requests` - File a report with the backend named by its MID
//! - `GET /api/v1/requests` - Search reports by id, device, or location
//! - `GET /api/v1/services` - List reportable services for an area
//! - `POST /api/v1/admin/refresh` - Rebuild the service catalog now
//! - `GET /metrics` - Prometheus metrics endpoint
//! - `GET /health/live` - Kubernetes liveness probe
//! - `GET /health/ready` - Kubernetes readiness probe

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use civicgate_lib::{
    CreateRequest, Error as LibError, SearchRequest, ServicesRequest, TelemetryEvent,
};
use civicgate_service_shared::{
    from_gateway_error, health_live, health_ready, metrics_handler, record_telemetry,
    record_telemetry_dropped, AppState, CreateBody, ProblemDetails, RequestId, SearchQuery,
    MetricsLayer, ServiceResponse, ServicesQuery, Validate,
};

/// Build the service router. `metrics_path` is where the scrape endpoint is
/// mounted.
pub fn router(state: AppState, metrics_path: &str) -> Router {
    Router::new()
        .route("/api/v1/requests", post(create_handler).get(search_handler))
        .route("/api/v1/services", get(services_handler))
        .route("/api/v1/admin/refresh", post(refresh_handler))
        .route(metrics_path, get(metrics_handler))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .layer(TraceLayer::new_for_http())
        .layer(MetricsLayer)
        .with_state(state)
}

/// Handle POST /api/v1/requests.
async fn create_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Result<Json<CreateBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ProblemDetails::bad_request(rejection.body_text(), request_id.as_str())
                .into_response()
        }
    };
    if let Err(problem) = body.validate(request_id.as_str()) {
        return problem.into_response();
    }

    let request = CreateRequest::from(body);
    info!(request_id = %request_id, mid = %request.mid, "handling create request");
    match state.gateway().create(&request).await {
        Ok(created) => {
            info!(request_id = %request_id, report_id = %created.report_id, "report created");
            ServiceResponse::created(created).into_response()
        }
        Err(e) => failure(&e, &request_id),
    }
}

/// Handle GET /api/v1/requests.
async fn search_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return ProblemDetails::bad_request(rejection.body_text(), request_id.as_str())
                .into_response()
        }
    };
    if let Err(problem) = query.validate(request_id.as_str()) {
        return problem.into_response();
    }

    match state.gateway().search(&SearchRequest::from(query)).await {
        Ok(found) => {
            info!(
                request_id = %request_id,
                reports = found.reports.len(),
                unavailable = found.unavailable,
                "search completed"
            );
            ServiceResponse::new(found).into_response()
        }
        Err(e) => failure(&e, &request_id),
    }
}

/// Handle GET /api/v1/services.
async fn services_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    query: Result<Query<ServicesQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return ProblemDetails::bad_request(rejection.body_text(), request_id.as_str())
                .into_response()
        }
    };
    if let Err(problem) = query.validate(request_id.as_str()) {
        return problem.into_response();
    }

    match state.gateway().services(&ServicesRequest::from(query)).await {
        Ok(listing) => ServiceResponse::new(listing).into_response(),
        Err(e) => failure(&e, &request_id),
    }
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    message: &'static str,
    generation: u64,
    services: usize,
    queried: usize,
}

/// Handle POST /api/v1/admin/refresh.
async fn refresh_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    match state.gateway().refresh().await {
        Ok(summary) => {
            info!(
                request_id = %request_id,
                generation = summary.generation,
                services = summary.services,
                "catalog refreshed"
            );
            ServiceResponse::new(RefreshResponse {
                message: "Refreshed",
                generation: summary.generation,
                services: summary.services,
                queried: summary.queried,
            })
            .into_response()
        }
        Err(e) => failure(&e, &request_id),
    }
}

fn failure(e: &LibError, request_id: &RequestId) -> Response {
    if e.is_client_error() {
        debug!(request_id = %request_id, error = %e, "request rejected");
    } else {
        error!(request_id = %request_id, error = %e, "request failed");
    }
    from_gateway_error(e, request_id.as_str()).into_response()
}

/// Consume the telemetry queue: log each event and turn it into metrics.
///
/// The task holds `state`, which owns the queue's sender, so it runs for the
/// life of the process.
pub fn spawn_telemetry_drain(
    state: AppState,
    mut events: mpsc::Receiver<TelemetryEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reported_dropped = 0;
        while let Some(event) = events.recv().await {
            match &event {
                TelemetryEvent::Request(e) => debug!(
                    request_id = e.request_id,
                    kind = %e.kind,
                    status = %e.status,
                    area = e.area.as_deref().unwrap_or(""),
                    failed_at = ?e.failed_at,
                    "request event"
                ),
                TelemetryEvent::Rpc(e) => debug!(
                    request_id = e.request_id,
                    method = %e.method,
                    route = %e.route,
                    status = %e.status,
                    results = e.results,
                    "rpc event"
                ),
            }
            record_telemetry(&event);

            let dropped = state.telemetry_dropped();
            if dropped != reported_dropped {
                warn!(dropped_total = dropped, "telemetry events dropped");
                record_telemetry_dropped(dropped);
                reported_dropped = dropped;
            }
        }
        debug!("telemetry queue closed");
    })
}

/// Run one catalog refresh after `delay`.
pub fn spawn_startup_refresh(state: AppState, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match state.gateway().refresh().await {
            Ok(summary) => info!(
                generation = summary.generation,
                services = summary.services,
                queried = summary.queried,
                "startup catalog refresh complete"
            ),
            Err(LibError::RefreshPartial { generation, failed }) => warn!(
                generation,
                failed = %failed.join(","),
                "startup catalog refresh incomplete"
            ),
            Err(e) => error!(error = %e, "startup catalog refresh failed"),
        }
    })
}
