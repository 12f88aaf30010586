use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenient result alias for the gateway core.
pub type Result<T> = std::result::Result<T, Error>;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Top-level gateway error type.
#[derive(Debug, Error)]
pub enum Error {
    /// An identifier token did not decompose into its expected fields.
    #[error("malformed identifier '{token}': {reason}")]
    MalformedId { token: String, reason: String },

    /// A free-text area name did not match any configured alias.
    #[error("unknown area: {alias}")]
    UnknownArea { alias: String },

    /// An adapter id is not present in the routing table.
    #[error("unknown adapter: {id}")]
    UnknownAdapter { id: String },

    /// The routing table has no adapter configured for the area.
    #[error("no adapter serves area {area}")]
    NoServiceInArea { area: String },

    /// The current catalog generation holds no services for the area.
    #[error("area {area} has no services in the current catalog")]
    AreaNotServiced { area: String },

    /// Request input failed type or range checks.
    #[error("invalid request: {}", format_fields(.fields))]
    Validation { fields: Vec<FieldError> },

    /// The resolved area has no usable dispatch target.
    #[error("no route available for {area}")]
    NoRoute { area: String },

    /// A dispatch target did not answer within its deadline.
    #[error("{target} timed out after {}ms", .deadline.as_millis())]
    DispatchTimeout { target: String, deadline: Duration },

    /// A dispatch target returned an application or transport error.
    #[error("{target} failed: {message}")]
    DispatchFailed { target: String, message: String },

    /// A catalog refresh was published but some adapters did not answer.
    #[error("catalog generation {generation} built without adapters: {}", .failed.join(", "))]
    RefreshPartial {
        generation: u64,
        failed: Vec<String>,
    },

    /// Routing configuration is invalid.
    #[error("invalid routing configuration: {message}")]
    Config { message: String },

    /// Coordinates could not be resolved to a city.
    #[error("no city found for coordinates ({lat}, {lng})")]
    Geocode { lat: f64, lng: f64 },

    /// Wrapper for IO errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wrapper for payload encoding errors.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Wrapper for TOML parsing errors.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Wrapper for HTTP client errors.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(token: &str, reason: impl Into<String>) -> Self {
        Error::MalformedId {
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's input rather than by routing or
    /// backend state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedId { .. }
                | Error::UnknownArea { .. }
                | Error::Validation { .. }
                | Error::Geocode { .. }
        )
    }

    /// True for per-target dispatch failures.
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            Error::DispatchTimeout { .. } | Error::DispatchFailed { .. }
        )
    }
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = Error::Validation {
            fields: vec![
                FieldError::new("lat", "not a number"),
                FieldError::new("mid", "required"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("lat: not a number"));
        assert!(text.contains("mid: required"));
        assert!(err.is_client_error());
    }

    #[test]
    fn timeout_message_reports_deadline() {
        let err = Error::DispatchTimeout {
            target: "SC2.SJ.1".to_string(),
            deadline: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "SC2.SJ.1 timed out after 3000ms");
        assert!(err.is_dispatch_error());
        assert!(!err.is_client_error());
    }

    #[test]
    fn refresh_partial_names_failed_adapters() {
        let err = Error::RefreshPartial {
            generation: 4,
            failed: vec!["CS1".to_string(), "EM1".to_string()],
        };
        assert!(err.to_string().contains("CS1, EM1"));
    }
}
