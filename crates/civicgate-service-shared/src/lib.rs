//! Shared infrastructure for civicgate HTTP services.
//!
//! - [`AppState`]: the core gateway shared with every handler
//! - [`health`]: liveness and readiness probes
//! - [`ProblemDetails`]: RFC 9457 error documents
//! - [`ServiceResponse`]: success bodies with their status code
//! - [`metrics`]: Prometheus recorder and gateway counters
//! - [`logging`]: structured logging setup
//! - [`middleware`]: correlation ids and HTTP metrics
//! - Public request shapes with transport-level validation
//!
//! # Architecture
//!
//! Handlers stay thin; routing, dispatch and catalog logic live in
//! `civicgate-lib`:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  axum Handler                                               │
//! │  - Parse body or query                                      │
//! │  - Check sizes                                              │
//! │  - Call the civicgate-lib Gateway                           │
//! │  - Map the result to a response or problem document         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Testing Support
//!
//! [`test_utils`] builds states over the fixture routing table with a scripted
//! transport. Enable the `test-utils` feature to use it from dependent crates.

pub mod health;
pub mod logging;
pub mod metrics;
pub mod middleware;
mod problem;
mod request;
mod response;
mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use health::{health_live, health_ready, HealthStatus};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    init_metrics, metrics_handler, record_dispatch_call, record_dispatch_results, record_request,
    record_telemetry, record_telemetry_dropped, MetricsConfig, MetricsError,
};
pub use middleware::{extract_or_generate_request_id, MetricsLayer, RequestId, REQUEST_ID_HEADER};
pub use problem::{
    from_gateway_error, InvalidParam, ProblemDetails, PROBLEM_BACKEND_FAILED,
    PROBLEM_INTERNAL_ERROR, PROBLEM_INVALID_REQUEST, PROBLEM_NO_ROUTE,
    PROBLEM_SERVICE_UNAVAILABLE, PROBLEM_UNKNOWN_AREA,
};
pub use request::{CreateBody, SearchQuery, ServicesQuery, Validate, MAX_SHORT_LEN, MAX_TEXT_LEN};
pub use response::ServiceResponse;
pub use state::{
    AppState, AppStateError, GatewaySettings, DEFAULT_CONFIG_PATH, DEFAULT_REFRESH_DELAY,
    DEFAULT_TELEMETRY_QUEUE,
};
