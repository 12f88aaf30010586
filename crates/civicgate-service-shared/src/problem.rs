//! RFC 9457 Problem Details for gateway errors.
//!
//! See: <https://www.rfc-editor.org/rfc/rfc9457.html>
//!
//! Every problem also carries the public `message` field, so clients that only
//! read `message` see "Failed" (or a short reason) the same way they see
//! "Created" on success.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use civicgate_lib::Error as LibError;

pub const PROBLEM_INVALID_REQUEST: &str = "/problems/invalid-request";
pub const PROBLEM_UNKNOWN_AREA: &str = "/problems/unknown-area";
pub const PROBLEM_NO_ROUTE: &str = "/problems/no-route";
pub const PROBLEM_BACKEND_FAILED: &str = "/problems/backend-failed";
pub const PROBLEM_INTERNAL_ERROR: &str = "/problems/internal-error";
pub const PROBLEM_SERVICE_UNAVAILABLE: &str = "/problems/service-unavailable";

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidParam {
    pub name: String,
    pub reason: String,
}

/// RFC 9457 problem document.
///
/// # Example
///
/// ```
/// use civicgate_service_shared::{ProblemDetails, PROBLEM_NO_ROUTE};
/// use axum::http::StatusCode;
///
/// let problem = ProblemDetails::new(PROBLEM_NO_ROUTE, "No Route", StatusCode::NOT_FOUND)
///     .with_detail("no route available for SJ")
///     .with_request_id("req-12345");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// Relative URI identifying the problem type.
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Correlation id of the failing exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Public message shared with success responses.
    pub message: String,
    #[serde(default, rename = "invalid-params", skip_serializing_if = "Vec::is_empty")]
    pub invalid_params: Vec<InvalidParam>,
}

impl ProblemDetails {
    pub fn new(type_uri: impl Into<String>, title: impl Into<String>, status: StatusCode) -> Self {
        let title = title.into();
        Self {
            type_uri: type_uri.into(),
            message: title.clone(),
            title,
            status: status.as_u16(),
            detail: None,
            instance: None,
            invalid_params: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.instance = Some(request_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// 400 for input that failed validation.
    pub fn bad_request(detail: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(PROBLEM_INVALID_REQUEST, "Invalid Request", StatusCode::BAD_REQUEST)
            .with_detail(detail)
            .with_request_id(request_id)
    }

    /// 502 for a backend that failed or timed out. The message is always
    /// "Failed"; the detail names the target.
    pub fn backend_failed(detail: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(PROBLEM_BACKEND_FAILED, "Backend Failed", StatusCode::BAD_GATEWAY)
            .with_message("Failed")
            .with_detail(detail)
            .with_request_id(request_id)
    }

    pub fn internal_error(detail: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(PROBLEM_INTERNAL_ERROR, "Internal Error", StatusCode::INTERNAL_SERVER_ERROR)
            .with_detail(detail)
            .with_request_id(request_id)
    }

    pub fn service_unavailable(detail: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(
            PROBLEM_SERVICE_UNAVAILABLE,
            "Service Unavailable",
            StatusCode::SERVICE_UNAVAILABLE,
        )
        .with_detail(detail)
        .with_request_id(request_id)
    }
}

impl std::fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title, self.detail.as_deref().unwrap_or(""))
    }
}

impl std::error::Error for ProblemDetails {}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Json(&self).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        *response.status_mut() = status;
        response
    }
}

/// Convert a core error into its public problem document.
pub fn from_gateway_error(error: &LibError, request_id: &str) -> ProblemDetails {
    match error {
        LibError::Validation { fields } => {
            let mut problem = ProblemDetails::bad_request(error.to_string(), request_id);
            problem.invalid_params = fields
                .iter()
                .map(|f| InvalidParam {
                    name: f.field.clone(),
                    reason: f.reason.clone(),
                })
                .collect();
            problem
        }
        LibError::MalformedId { .. } => {
            ProblemDetails::bad_request("identifier is not valid", request_id)
        }
        LibError::Geocode { .. } => ProblemDetails::new(
            PROBLEM_UNKNOWN_AREA,
            "Unknown Area",
            StatusCode::NOT_FOUND,
        )
        .with_detail("no serviced area contains the given coordinates")
        .with_request_id(request_id),
        LibError::UnknownArea { .. } => {
            ProblemDetails::new(PROBLEM_UNKNOWN_AREA, "Unknown Area", StatusCode::NOT_FOUND)
                .with_detail(error.to_string())
                .with_request_id(request_id)
        }
        LibError::NoRoute { .. }
        | LibError::NoServiceInArea { .. }
        | LibError::AreaNotServiced { .. } => {
            ProblemDetails::new(PROBLEM_NO_ROUTE, "No Route", StatusCode::NOT_FOUND)
                .with_detail(error.to_string())
                .with_request_id(request_id)
        }
        LibError::DispatchTimeout { .. } | LibError::DispatchFailed { .. } => {
            ProblemDetails::backend_failed(error.to_string(), request_id)
        }
        LibError::RefreshPartial { .. } => {
            ProblemDetails::service_unavailable(error.to_string(), request_id)
        }
        _ => ProblemDetails::internal_error(error.to_string(), request_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicgate_lib::FieldError;
    use std::time::Duration;

    #[test]
    fn test_problem_details_new() {
        let problem = ProblemDetails::new(PROBLEM_NO_ROUTE, "No Route", StatusCode::NOT_FOUND);
        assert_eq!(problem.type_uri, PROBLEM_NO_ROUTE);
        assert_eq!(problem.status, 404);
        assert_eq!(problem.message, "No Route");
    }

    #[test]
    fn test_validation_error_lists_fields() {
        let error = LibError::Validation {
            fields: vec![
                FieldError::new("lat", "not a number"),
                FieldError::new("description", "required"),
            ],
        };
        let problem = from_gateway_error(&error, "req-1");
        assert_eq!(problem.status, 400);
        assert_eq!(problem.invalid_params.len(), 2);
        assert_eq!(problem.invalid_params[0].name, "lat");
        assert!(problem.detail.as_deref().unwrap().contains("description: required"));
    }

    #[test]
    fn test_dispatch_errors_are_failed_bad_gateway() {
        let timeout = LibError::DispatchTimeout {
            target: "CS1.SJ.3".to_string(),
            deadline: Duration::from_secs(3),
        };
        let problem = from_gateway_error(&timeout, "req-2");
        assert_eq!(problem.status, 502);
        assert_eq!(problem.message, "Failed");

        let failed = LibError::DispatchFailed {
            target: "CS1.SJ.3".to_string(),
            message: "refused".to_string(),
        };
        assert_eq!(from_gateway_error(&failed, "req-3").message, "Failed");
    }

    #[test]
    fn test_malformed_id_does_not_echo_token() {
        let error = LibError::MalformedId {
            token: "CS1.SJ.x.1".to_string(),
            reason: "provider is not numeric".to_string(),
        };
        let problem = from_gateway_error(&error, "req-4");
        assert_eq!(problem.status, 400);
        assert!(!problem.detail.as_deref().unwrap().contains("CS1"));
    }

    #[test]
    fn test_routing_errors_are_not_found() {
        for error in [
            LibError::UnknownArea { alias: "Atlantis".to_string() },
            LibError::NoRoute { area: "SJ".to_string() },
            LibError::AreaNotServiced { area: "SJ".to_string() },
            LibError::Geocode { lat: 1.0, lng: 2.0 },
        ] {
            assert_eq!(from_gateway_error(&error, "req").status, 404, "{error}");
        }
    }

    #[test]
    fn test_problem_details_serialization() {
        let problem = ProblemDetails::bad_request("Test error", "req-test");
        let json = serde_json::to_string(&problem).unwrap();
        assert!(json.contains("\"type\":\"/problems/invalid-request\""));
        assert!(json.contains("\"status\":400"));
        assert!(json.contains("\"instance\":\"req-test\""));
        assert!(!json.contains("invalid-params"));
    }
}
