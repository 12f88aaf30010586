//! Routing configuration model.
//!
//! The routing table is built from a TOML document describing adapters and
//! areas. Parsing only checks shape; cross-references are validated by
//! [`RoutingTable::from_config`](crate::routing::RoutingTable::from_config).
//!
//! ```toml
//! [[adapters]]
//! id = "CS1"
//! name = "CitySourced"
//! kind = "citysourced"
//! address = "http://127.0.0.1:5081/rpc"
//!
//! [[areas]]
//! id = "SJ"
//! name = "San Jose"
//! aliases = ["san jose ca"]
//! bounds = { min_lat = 37.12, min_lng = -122.05, max_lat = 37.47, max_lng = -121.58 }
//!
//! [[areas.providers]]
//! id = 3
//! adapter = "CS1"
//! name = "SJ 311"
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::id::{AdapterId, AreaId, ProviderId, ServiceCode};

/// Complete routing configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub areas: Vec<AreaConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        debug!(
            path = %path.display(),
            adapters = config.adapters.len(),
            areas = config.areas.len(),
            "loaded routing configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Backend integration interface type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    CitySourced,
    Email,
    SeeClickFix,
    Open311,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            AdapterKind::CitySourced => "citysourced",
            AdapterKind::Email => "email",
            AdapterKind::SeeClickFix => "seeclickfix",
            AdapterKind::Open311 => "open311",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub id: AdapterId,
    pub name: String,
    pub kind: AdapterKind,
    /// Network endpoint the RPC transport calls.
    pub address: String,
    /// Credential placeholder forwarded to the adapter process by deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Latitude/longitude bounding box used by the built-in geocoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        [self.min_lat, self.min_lng, self.max_lat, self.max_lng]
            .iter()
            .all(|v| v.is_finite())
            && self.min_lat <= self.max_lat
            && self.min_lng <= self.max_lng
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaConfig {
    pub id: AreaId,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Where a provider's service catalog comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogSource {
    /// Queried from the adapter with `Services.All` on every refresh.
    #[default]
    Live,
    /// Taken verbatim from the configured `services` list.
    Seed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub adapter: AdapterId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub catalog: CatalogSource,
    #[serde(default)]
    pub services: Vec<SeedService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedService {
    pub code: ServiceCode,
    pub name: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
