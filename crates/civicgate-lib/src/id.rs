//! Identifier scheme for dispatch addressing.
//!
//! A [`ServiceId`] (MID) names a reportable issue type at one backend scope and
//! travels through URLs and payloads as a single opaque token:
//!
//! ```text
//! CS1.SJ.3.42
//! │   │  │ └─ service code (numeric, unique within the provider)
//! │   │  └─── provider id (numeric, unique within the area)
//! │   └────── area id
//! └────────── adapter id
//! ```
//!
//! [`NRoute`] is the same tuple without the service code and is what the
//! dispatcher targets. [`ReportId`] reuses the route prefix so a report
//! identifier returned by a backend can be routed back to it.
//!
//! Tokens are stable across restarts; they may be persisted in links.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Field delimiter for MID, NRoute and report id tokens.
pub const DELIMITER: char = '.';

fn validate_code(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::malformed(value, format!("{kind} id is empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(Error::malformed(
            value,
            format!("{kind} id contains invalid character '{bad}'"),
        ));
    }
    Ok(())
}

macro_rules! code_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a code. Codes are ASCII alphanumerics plus `_`/`-`.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                validate_code($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

code_id!(
    /// Canonical code for a serviced geography, e.g. `SJ`.
    AreaId,
    "area"
);

code_id!(
    /// Identifier of one backend integration process, e.g. `CS1`.
    AdapterId,
    "adapter"
);

/// Account/configuration scope of an adapter within one area.
pub type ProviderId = u32;

/// Numeric service code, unique within its provider.
pub type ServiceCode = u32;

/// The (adapter, area, provider) dispatch-target tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NRoute {
    pub adapter: AdapterId,
    pub area: AreaId,
    pub provider: ProviderId,
}

impl NRoute {
    pub fn new(adapter: AdapterId, area: AreaId, provider: ProviderId) -> Self {
        Self {
            adapter,
            area,
            provider,
        }
    }

    /// Extend this route with a service code.
    pub fn service(&self, code: ServiceCode) -> ServiceId {
        ServiceId {
            route: self.clone(),
            code,
        }
    }
}

impl fmt::Display for NRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}",
            self.adapter, self.area, self.provider
        )
    }
}

impl FromStr for NRoute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(DELIMITER).collect();
        if fields.len() != 3 {
            return Err(Error::malformed(
                s,
                format!("expected 3 fields, found {}", fields.len()),
            ));
        }
        parse_route(s, fields[0], fields[1], fields[2])
    }
}

fn parse_route(token: &str, adapter: &str, area: &str, provider: &str) -> Result<NRoute> {
    let adapter = AdapterId::new(adapter).map_err(|_| Error::malformed(token, "bad adapter id"))?;
    let area = AreaId::new(area).map_err(|_| Error::malformed(token, "bad area id"))?;
    let provider = parse_number(token, "provider id", provider)?;
    Ok(NRoute::new(adapter, area, provider))
}

fn parse_number(token: &str, what: &str, raw: &str) -> Result<u32> {
    // `u32::from_str` accepts a leading '+', which would break the round trip.
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::malformed(token, format!("{what} is not numeric")));
    }
    if raw.len() > 1 && raw.starts_with('0') {
        return Err(Error::malformed(token, format!("{what} has leading zeros")));
    }
    raw.parse::<u32>()
        .map_err(|_| Error::malformed(token, format!("{what} is out of range")))
}

/// Service identifier (MID): an [`NRoute`] plus a numeric service code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub route: NRoute,
    pub code: ServiceCode,
}

impl ServiceId {
    pub fn new(adapter: AdapterId, area: AreaId, provider: ProviderId, code: ServiceCode) -> Self {
        NRoute::new(adapter, area, provider).service(code)
    }

    pub fn adapter(&self) -> &AdapterId {
        &self.route.adapter
    }

    pub fn area(&self) -> &AreaId {
        &self.route.area
    }

    pub fn provider(&self) -> ProviderId {
        self.route.provider
    }
}

/// Parse a MID token such as `CS1.SJ.3.42`.
///
/// Fails with [`Error::MalformedId`] unless the token has exactly four fields,
/// valid adapter/area codes, and canonical decimal provider/service numbers.
pub fn parse_mid(token: &str) -> Result<ServiceId> {
    token.parse()
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}", self.route, self.code)
    }
}

impl FromStr for ServiceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(DELIMITER).collect();
        if fields.len() != 4 {
            return Err(Error::malformed(
                s,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        }
        let route = parse_route(s, fields[0], fields[1], fields[2])?;
        let code = parse_number(s, "service code", fields[3])?;
        Ok(route.service(code))
    }
}

impl Serialize for ServiceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Report identifier: the route that owns the report plus the backend's own id.
///
/// The backend id is opaque and may itself contain the delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportId {
    pub route: NRoute,
    pub backend_id: String,
}

impl ReportId {
    pub fn new(route: NRoute, backend_id: impl Into<String>) -> Result<Self> {
        let backend_id = backend_id.into();
        if backend_id.trim().is_empty() {
            return Err(Error::malformed(&backend_id, "backend report id is empty"));
        }
        Ok(Self { route, backend_id })
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}", self.route, self.backend_id)
    }
}

impl FromStr for ReportId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.splitn(4, DELIMITER).collect();
        if fields.len() != 4 || fields[3].is_empty() {
            return Err(Error::malformed(s, "expected route and backend report id"));
        }
        let route = parse_route(s, fields[0], fields[1], fields[2])?;
        Self::new(route, fields[3])
    }
}

impl Serialize for ReportId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReportId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
