//! Response wrapper for successful HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Successful response body with the HTTP status it is sent with.
///
/// # Example
///
/// ```
/// use civicgate_service_shared::ServiceResponse;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Created {
///     message: String,
///     report_id: String,
/// }
///
/// let response = ServiceResponse::created(Created {
///     message: "Created".to_string(),
///     report_id: "CS1.SJ.3.88121".to_string(),
/// });
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
    #[serde(flatten)]
    pub data: T,
    #[serde(skip, default = "default_status")]
    pub status: StatusCode,
}

fn default_status() -> StatusCode {
    StatusCode::OK
}

impl<T> ServiceResponse<T> {
    /// 200 OK.
    pub fn new(data: T) -> Self {
        Self {
            data,
            status: StatusCode::OK,
        }
    }

    /// 201 Created.
    pub fn created(data: T) -> Self {
        Self {
            data,
            status: StatusCode::CREATED,
        }
    }
}

impl<T> From<T> for ServiceResponse<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: Serialize> IntoResponse for ServiceResponse<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.data)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        message: String,
        value: i32,
    }

    fn data() -> TestData {
        TestData {
            message: "OK".to_string(),
            value: 42,
        }
    }

    #[test]
    fn test_response_serializes_payload_only() {
        let json = serde_json::to_string(&ServiceResponse::new(data())).unwrap();
        assert_eq!(json, r#"{"message":"OK","value":42}"#);
    }

    #[test]
    fn test_created_status() {
        let response = ServiceResponse::created(data()).into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_response_from_trait() {
        let response: ServiceResponse<TestData> = data().into();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.data, data());
    }
}
