//! RPC contract between the gateway and adapter processes.
//!
//! Each method name is paired with one typed request payload implementing
//! [`RpcCall`], whose associated `Response` type decodes the adapter's reply.
//! The set of `RpcCall` impls is the method registry: encoding happens once
//! per dispatch with `serde_json`, decoding once per answering target.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::id::{AreaId, NRoute, ProviderId, ServiceCode, ServiceId};
use crate::routing::Adapter;

/// Method names every adapter implements a subset of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    ServicesAll,
    ServicesArea,
    ReportCreate,
    ReportSearchLL,
    ReportSearchDID,
    ReportSearchRID,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 6] = [
        RpcMethod::ServicesAll,
        RpcMethod::ServicesArea,
        RpcMethod::ReportCreate,
        RpcMethod::ReportSearchLL,
        RpcMethod::ReportSearchDID,
        RpcMethod::ReportSearchRID,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::ServicesAll => "Services.All",
            RpcMethod::ServicesArea => "Services.Area",
            RpcMethod::ReportCreate => "Report.Create",
            RpcMethod::ReportSearchLL => "Report.SearchLL",
            RpcMethod::ReportSearchDID => "Report.SearchDID",
            RpcMethod::ReportSearchRID => "Report.SearchRID",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RpcMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::DispatchFailed {
                target: "-".to_string(),
                message: format!("unknown RPC method {s}"),
            })
    }
}

/// Decoded adapter reply.
pub trait RpcResponse: DeserializeOwned + Send + 'static {
    /// Number of result items, reported in telemetry.
    fn result_count(&self) -> usize {
        1
    }
}

/// A typed request payload bound to one RPC method.
pub trait RpcCall: Serialize + Send + Sync {
    const METHOD: RpcMethod;
    type Response: RpcResponse;
}

// ---------------------------------------------------------------------------
// Service catalog
// ---------------------------------------------------------------------------

/// `Services.All`: an adapter's full catalog across every area it serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesAll {}

/// `Services.Area`: the catalog of one provider route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesArea {
    pub area: AreaId,
}

/// One catalog entry as reported by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub area: AreaId,
    pub provider: ProviderId,
    pub code: ServiceCode,
    pub name: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogReply {
    #[serde(default)]
    pub services: Vec<CatalogEntry>,
}

impl RpcResponse for CatalogReply {
    fn result_count(&self) -> usize {
        self.services.len()
    }
}

impl RpcCall for ServicesAll {
    const METHOD: RpcMethod = RpcMethod::ServicesAll;
    type Response = CatalogReply;
}

impl RpcCall for ServicesArea {
    const METHOD: RpcMethod = RpcMethod::ServicesArea;
    type Response = CatalogReply;
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// `Report.Create` payload, already validated and typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReport {
    pub service: ServiceId,
    pub service_name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default)]
    pub contact: Contact,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
}

/// Adapter acknowledgment of a created report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReceipt {
    /// The backend's own report identifier.
    pub report_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl RpcResponse for CreateReceipt {}

impl RpcCall for CreateReport {
    const METHOD: RpcMethod = RpcMethod::ReportCreate;
    type Response = CreateReceipt;
}

/// `Report.SearchLL`: reports near a point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchByLocation {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: u32,
    pub max_results: usize,
}

/// `Report.SearchDID`: reports filed from one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchByDevice {
    pub device_id: String,
    pub max_results: usize,
}

/// `Report.SearchRID`: a single report by its backend identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchByReport {
    pub report_id: String,
}

/// A report as returned by an adapter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Backend report identifier.
    pub id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchReply {
    #[serde(default)]
    pub reports: Vec<ReportRecord>,
}

impl RpcResponse for SearchReply {
    fn result_count(&self) -> usize {
        self.reports.len()
    }
}

impl RpcCall for SearchByLocation {
    const METHOD: RpcMethod = RpcMethod::ReportSearchLL;
    type Response = SearchReply;
}

impl RpcCall for SearchByDevice {
    const METHOD: RpcMethod = RpcMethod::ReportSearchDID;
    type Response = SearchReply;
}

impl RpcCall for SearchByReport {
    const METHOD: RpcMethod = RpcMethod::ReportSearchRID;
    type Response = SearchReply;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Moves an encoded payload to an adapter and returns its encoded reply.
///
/// Implementations report application-level failures as
/// [`Error::DispatchFailed`]; deadlines are enforced by the dispatcher.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(
        &self,
        adapter: &Adapter,
        route: Option<&NRoute>,
        method: RpcMethod,
        params: Value,
    ) -> Result<Value>;
}

/// Wire envelope for [`HttpTransport`].
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub params: Value,
}

/// Adapter reply envelope: exactly one of `result` or `error` is expected.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn into_result(self, target: &str) -> Result<Value> {
        match (self.error, self.result) {
            (Some(message), _) => Err(Error::DispatchFailed {
                target: target.to_string(),
                message,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(Error::DispatchFailed {
                target: target.to_string(),
                message: "empty reply".to_string(),
            }),
        }
    }
}

/// JSON-over-HTTP transport: POSTs an [`RpcEnvelope`] to the adapter address.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(
        &self,
        adapter: &Adapter,
        route: Option<&NRoute>,
        method: RpcMethod,
        params: Value,
    ) -> Result<Value> {
        let envelope = RpcEnvelope {
            method: method.as_str().to_string(),
            route: route.map(ToString::to_string),
            params,
        };
        trace!(adapter = %adapter.id, address = %adapter.address, %method, "sending rpc");
        let reply: RpcReply = self
            .client
            .post(&adapter.address)
            .json(&envelope)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let target = route
            .map(ToString::to_string)
            .unwrap_or_else(|| adapter.id.to_string());
        reply.into_result(&target)
    }
}
