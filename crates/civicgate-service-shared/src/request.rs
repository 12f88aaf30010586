//! Public request shapes for HTTP endpoints.
//!
//! The public API accepts loosely typed JSON (coordinates as numbers or
//! strings). These types only normalize transport-level shape and enforce size
//! limits; field semantics are validated by the gateway pipeline.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use civicgate_lib::{CreateRequest, SearchRequest, ServicesRequest};

use crate::ProblemDetails;

/// Longest accepted free-text field, in characters.
pub const MAX_TEXT_LEN: usize = 4_000;
/// Longest accepted short field (names, ids, phone), in characters.
pub const MAX_SHORT_LEN: usize = 256;

/// Transport-level checks run before a request enters the pipeline.
pub trait Validate {
    /// Returns a boxed `ProblemDetails` to keep `Result::Err` small.
    fn validate(&self, request_id: &str) -> Result<(), Box<ProblemDetails>>;
}

/// Accept a JSON string, number, or bool and keep its text form.
fn loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected a string or number, found {other}"
            )))
        }
    })
}

fn check_lengths(
    fields: &[(&str, &str, usize)],
    request_id: &str,
) -> Result<(), Box<ProblemDetails>> {
    for (name, value, max) in fields {
        if value.chars().count() > *max {
            return Err(Box::new(ProblemDetails::bad_request(
                format!("The '{name}' field must be at most {max} characters"),
                request_id,
            )));
        }
    }
    Ok(())
}

/// Body of `POST /api/v1/requests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateBody {
    #[serde(deserialize_with = "loose_string")]
    pub mid: String,
    #[serde(deserialize_with = "loose_string")]
    pub lat: String,
    #[serde(deserialize_with = "loose_string")]
    pub lng: String,
    #[serde(deserialize_with = "loose_string")]
    pub address: String,
    #[serde(deserialize_with = "loose_string")]
    pub description: String,
    #[serde(deserialize_with = "loose_string")]
    pub device_id: String,
    #[serde(deserialize_with = "loose_string")]
    pub first_name: String,
    #[serde(deserialize_with = "loose_string")]
    pub last_name: String,
    #[serde(deserialize_with = "loose_string")]
    pub email: String,
    #[serde(deserialize_with = "loose_string")]
    pub phone: String,
}

impl Validate for CreateBody {
    fn validate(&self, request_id: &str) -> Result<(), Box<ProblemDetails>> {
        check_lengths(
            &[
                ("mid", &self.mid, MAX_SHORT_LEN),
                ("address", &self.address, MAX_TEXT_LEN),
                ("description", &self.description, MAX_TEXT_LEN),
                ("device_id", &self.device_id, MAX_SHORT_LEN),
                ("first_name", &self.first_name, MAX_SHORT_LEN),
                ("last_name", &self.last_name, MAX_SHORT_LEN),
                ("email", &self.email, MAX_SHORT_LEN),
                ("phone", &self.phone, MAX_SHORT_LEN),
            ],
            request_id,
        )
    }
}

impl From<CreateBody> for CreateRequest {
    fn from(body: CreateBody) -> Self {
        CreateRequest {
            mid: body.mid,
            lat: body.lat,
            lng: body.lng,
            address: body.address,
            description: body.description,
            device_id: body.device_id,
            first_name: body.first_name,
            last_name: body.last_name,
            email: body.email,
            phone: body.phone,
        }
    }
}

/// Query of `GET /api/v1/requests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub rid: String,
    pub did: String,
    pub lat: String,
    pub lng: String,
    pub radius: String,
    #[serde(alias = "maxResults")]
    pub max_results: String,
    pub area: String,
}

impl Validate for SearchQuery {
    fn validate(&self, request_id: &str) -> Result<(), Box<ProblemDetails>> {
        check_lengths(
            &[
                ("rid", &self.rid, MAX_SHORT_LEN),
                ("did", &self.did, MAX_SHORT_LEN),
                ("area", &self.area, MAX_SHORT_LEN),
            ],
            request_id,
        )
    }
}

impl From<SearchQuery> for SearchRequest {
    fn from(query: SearchQuery) -> Self {
        SearchRequest {
            rid: query.rid,
            did: query.did,
            lat: query.lat,
            lng: query.lng,
            radius: query.radius,
            max_results: query.max_results,
            area: query.area,
        }
    }
}

/// Query of `GET /api/v1/services`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesQuery {
    #[serde(alias = "city")]
    pub area: String,
    pub lat: String,
    pub lng: String,
}

impl Validate for ServicesQuery {
    fn validate(&self, request_id: &str) -> Result<(), Box<ProblemDetails>> {
        check_lengths(&[("area", &self.area, MAX_SHORT_LEN)], request_id)
    }
}

impl From<ServicesQuery> for ServicesRequest {
    fn from(query: ServicesQuery) -> Self {
        ServicesRequest {
            area: query.area,
            lat: query.lat,
            lng: query.lng,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_body_accepts_numeric_coordinates() {
        let body: CreateBody = serde_json::from_str(
            r#"{"mid":"CS1.SJ.3.10","lat":37.3382,"lng":"-121.8863","description":"Pothole"}"#,
        )
        .unwrap();
        assert_eq!(body.lat, "37.3382");
        assert_eq!(body.lng, "-121.8863");
        assert!(body.email.is_empty());

        let request = CreateRequest::from(body);
        assert_eq!(request.mid, "CS1.SJ.3.10");
    }

    #[test]
    fn test_create_body_rejects_structured_values() {
        let result: Result<CreateBody, _> = serde_json::from_str(r#"{"lat":[1,2]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_body_null_is_empty() {
        let body: CreateBody = serde_json::from_str(r#"{"phone":null}"#).unwrap();
        assert!(body.phone.is_empty());
    }

    #[test]
    fn test_overlong_description_is_rejected() {
        let body = CreateBody {
            description: "x".repeat(MAX_TEXT_LEN + 1),
            ..CreateBody::default()
        };
        let problem = body.validate("req-1").unwrap_err();
        assert_eq!(problem.status, 400);
        assert!(problem.detail.as_deref().unwrap().contains("description"));
    }

    #[test]
    fn test_search_query_alias() {
        let query: SearchQuery = serde_json::from_str(r#"{"maxResults":"5","did":"abc"}"#).unwrap();
        assert_eq!(query.max_results, "5");
        assert!(query.validate("req").is_ok());
        assert_eq!(SearchRequest::from(query).did, "abc");
    }

    #[test]
    fn test_services_query_city_alias() {
        let query: ServicesQuery = serde_json::from_str(r#"{"city":"San Jose"}"#).unwrap();
        assert_eq!(ServicesRequest::from(query).area, "San Jose");
    }
}
