//! Request pipeline: the gateway service object.
//!
//! [`Gateway`] owns the routing table, the service cache, the dispatcher, the
//! geocoder and the telemetry sink for one process. Every public request
//! (create, search, services, refresh) walks the same stage machine:
//!
//! `received -> validated -> routed -> dispatched -> merged -> responded`
//!
//! Any failure moves the request to `errored`, tagged with the stage that
//! failed. Request telemetry is emitted on entry and on the terminal stage.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{RefreshSummary, Service, ServiceCache};
use crate::config::CatalogSource;
use crate::dispatch::{DispatchTarget, Dispatcher, DEFAULT_DEADLINE};
use crate::error::{Error, FieldError, Result};
use crate::geocode::{BoundsGeocoder, Geocoder};
use crate::id::{parse_mid, AreaId, NRoute, ReportId, ServiceId};
use crate::routing::RoutingTable;
use crate::rpc::{
    CatalogReply, Contact, CreateReceipt, CreateReport, HttpTransport, ReportRecord,
    RpcTransport, SearchByDevice, SearchByLocation, SearchByReport, SearchReply, ServicesArea,
};
use crate::telemetry::{NoopTelemetry, RequestEvent, RequestKind, Status, TelemetrySink};

pub const DEFAULT_RADIUS_M: u32 = 100;
pub const MAX_RADIUS_M: u32 = 5_000;
pub const DEFAULT_MAX_RESULTS: usize = 20;
pub const MAX_RESULTS: usize = 100;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Lifecycle stage of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Validated,
    Routed,
    Dispatched,
    Merged,
    Responded,
    Errored,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Received => Stage::Validated,
            Stage::Validated => Stage::Routed,
            Stage::Routed => Stage::Dispatched,
            Stage::Dispatched => Stage::Merged,
            Stage::Merged => Stage::Responded,
            Stage::Responded | Stage::Errored => Stage::Errored,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Routed => "routed",
            Stage::Dispatched => "dispatched",
            Stage::Merged => "merged",
            Stage::Responded => "responded",
            Stage::Errored => "errored",
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

/// Normalized create request. Every field arrives as text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub mid: String,
    pub lat: String,
    pub lng: String,
    pub address: String,
    pub description: String,
    pub device_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

/// Normalized search request. At least one of `rid`, `did`, or a valid
/// `lat`/`lng` pair is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub rid: String,
    pub did: String,
    pub lat: String,
    pub lng: String,
    pub radius: String,
    pub max_results: String,
    pub area: String,
}

/// Normalized service listing request: an area alias or coordinates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesRequest {
    pub area: String,
    pub lat: String,
    pub lng: String,
}

/// Operator-triggered catalog refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshRequest;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub message: String,
    pub report_id: ReportId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// A report returned by search, addressed by its gateway-wide id.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub report_id: ReportId,
    pub service_name: String,
    pub description: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<AreaId>,
    pub reports: Vec<Report>,
    /// Targets that failed or timed out; their reports are missing.
    pub unavailable: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesResponse {
    pub message: String,
    pub area: AreaId,
    pub generation: u64,
    pub services: Vec<Service>,
}

// ---------------------------------------------------------------------------
// Pipeline plumbing
// ---------------------------------------------------------------------------

/// Per-request state carried through the stage machine.
#[derive(Debug)]
pub struct RequestContext {
    request_id: u64,
    kind: RequestKind,
    stage: Stage,
    area: Option<AreaId>,
}

impl RequestContext {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        debug!(
            request_id = self.request_id,
            kind = %self.kind,
            %stage,
            area = self.area.as_ref().map(AreaId::as_str).unwrap_or("-"),
            "request stage"
        );
    }

    fn set_area(&mut self, area: &AreaId) {
        self.area = Some(area.clone());
    }
}

/// A request kind the gateway knows how to carry through the pipeline.
#[async_trait]
pub trait PipelineRequest: Send + Sync {
    const KIND: RequestKind;
    type Response: Send;

    /// Run every stage after `received`, advancing `ctx` as each completes.
    async fn process(&self, gateway: &Gateway, ctx: &mut RequestContext) -> Result<Self::Response>;
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct Gateway {
    routing: Arc<RoutingTable>,
    cache: Arc<ServiceCache>,
    dispatcher: Dispatcher,
    geocoder: Arc<dyn Geocoder>,
    telemetry: Arc<dyn TelemetrySink>,
    next_request_id: AtomicU64,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("cache", &self.cache)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

pub struct GatewayBuilder {
    routing: Arc<RoutingTable>,
    transport: Option<Arc<dyn RpcTransport>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    deadline: Duration,
}

impl GatewayBuilder {
    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Per-target dispatch deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn build(self) -> Gateway {
        let routing = self.routing;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::default()));
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NoopTelemetry));
        let geocoder = self
            .geocoder
            .unwrap_or_else(|| Arc::new(BoundsGeocoder::from_table(&routing)));
        let dispatcher = Dispatcher::new(Arc::clone(&routing), transport, Arc::clone(&telemetry))
            .with_deadline(self.deadline);

        Gateway {
            cache: Arc::new(ServiceCache::new(Arc::clone(&routing))),
            routing,
            dispatcher,
            geocoder,
            telemetry,
            next_request_id: AtomicU64::new(1),
        }
    }
}

impl Gateway {
    pub fn builder(routing: Arc<RoutingTable>) -> GatewayBuilder {
        GatewayBuilder {
            routing,
            transport: None,
            telemetry: None,
            geocoder: None,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn create(&self, request: &CreateRequest) -> Result<CreateResponse> {
        self.handle(request).await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.handle(request).await
    }

    pub async fn services(&self, request: &ServicesRequest) -> Result<ServicesResponse> {
        self.handle(request).await
    }

    /// Rebuild the service catalog. See [`ServiceCache::refresh`].
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        self.handle(&RefreshRequest).await
    }

    /// Drive `request` through the pipeline with lifecycle logging and
    /// request telemetry.
    pub async fn handle<R: PipelineRequest>(&self, request: &R) -> Result<R::Response> {
        let mut ctx = RequestContext {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            kind: R::KIND,
            stage: Stage::Received,
            area: None,
        };
        self.emit(&ctx, Status::Open, None);
        ctx.enter(Stage::Received);

        match request.process(self, &mut ctx).await {
            Ok(response) => {
                ctx.enter(Stage::Responded);
                self.emit(&ctx, Status::Done, None);
                Ok(response)
            }
            Err(err) => {
                let failed_at = ctx.stage.next();
                ctx.enter(Stage::Errored);
                if err.is_client_error() {
                    info!(request_id = ctx.request_id, kind = %ctx.kind, %failed_at, error = %err, "request rejected");
                } else {
                    warn!(request_id = ctx.request_id, kind = %ctx.kind, %failed_at, error = %err, "request failed");
                }
                self.emit(&ctx, Status::Error, Some(failed_at));
                Err(err)
            }
        }
    }

    fn emit(&self, ctx: &RequestContext, status: Status, failed_at: Option<Stage>) {
        self.telemetry.send_request(RequestEvent {
            request_id: ctx.request_id,
            kind: ctx.kind,
            status,
            area: ctx.area.as_ref().map(ToString::to_string),
            failed_at,
            timestamp: Utc::now(),
        });
    }

    /// Resolve an explicit alias, else reverse-geocode the point.
    async fn locate(&self, alias: Option<&str>, point: Option<(f64, f64)>) -> Result<AreaId> {
        if let Some(alias) = alias {
            return self.routing.resolve_area(alias);
        }
        match point {
            Some((lat, lng)) => {
                let city = self.geocoder.city_for_coordinates(lat, lng).await?;
                self.routing.resolve_area(&city)
            }
            None => Err(Error::Validation {
                fields: vec![FieldError::new("area", "area or coordinates are required")],
            }),
        }
    }

    fn routes(&self, area: &AreaId) -> Result<Vec<NRoute>> {
        self.routing
            .routes_for_area(area)
            .map_err(|_| Error::NoRoute {
                area: area.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn text(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Parse an optional coordinate pair. Returns `None` when neither value is
/// supplied or the pair is exactly (0, 0).
fn coordinates(lat: &str, lng: &str, errors: &mut Vec<FieldError>) -> Option<(f64, f64)> {
    let (lat, lng) = match (text(lat), text(lng)) {
        (None, None) => return None,
        (Some(lat), Some(lng)) => (lat, lng),
        (None, Some(_)) => {
            errors.push(FieldError::new("lat", "required when lng is supplied"));
            return None;
        }
        (Some(_), None) => {
            errors.push(FieldError::new("lng", "required when lat is supplied"));
            return None;
        }
    };
    let lat = number(lat, "lat", -90.0, 90.0, errors);
    let lng = number(lng, "lng", -180.0, 180.0, errors);
    match (lat, lng) {
        (Some(lat), Some(lng)) if lat == 0.0 && lng == 0.0 => None,
        (Some(lat), Some(lng)) => Some((lat, lng)),
        _ => None,
    }
}

fn number(raw: &str, field: &str, min: f64, max: f64, errors: &mut Vec<FieldError>) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(value) if !value.is_finite() => {
            errors.push(FieldError::new(field, "must be a finite number"));
            None
        }
        Ok(value) if value < min || value > max => {
            errors.push(FieldError::new(field, format!("must be between {min} and {max}")));
            None
        }
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(FieldError::new(field, "not a number"));
            None
        }
    }
}

fn bounded<T>(raw: &str, field: &str, default: T, min: T, max: T, errors: &mut Vec<FieldError>) -> T
where
    T: std::str::FromStr + PartialOrd + Copy + fmt::Display,
{
    let Some(raw) = text(raw) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if value >= min && value <= max => value,
        _ => {
            errors.push(FieldError::new(field, format!("must be an integer between {min} and {max}")));
            default
        }
    }
}

fn finish_validation(errors: Vec<FieldError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { fields: errors })
    }
}

#[derive(Debug)]
struct ValidCreate {
    service: ServiceId,
    lat: f64,
    lng: f64,
    address: String,
    description: String,
    device_id: String,
    contact: Contact,
}

impl CreateRequest {
    fn validate(&self) -> Result<ValidCreate> {
        let mut errors = Vec::new();
        let service = match text(&self.mid) {
            None => {
                errors.push(FieldError::new("mid", "required"));
                None
            }
            Some(mid) => match parse_mid(mid) {
                Ok(service) => Some(service),
                Err(_) => {
                    errors.push(FieldError::new("mid", "not a valid service identifier"));
                    None
                }
            },
        };
        let point = coordinates(&self.lat, &self.lng, &mut errors);
        if point.is_none() && !errors.iter().any(|e| e.field == "lat" || e.field == "lng") {
            errors.push(FieldError::new("lat", "valid coordinates are required"));
        }
        let description = text(&self.description);
        if description.is_none() {
            errors.push(FieldError::new("description", "required"));
        }
        finish_validation(errors)?;

        match (service, point, description) {
            (Some(service), Some((lat, lng)), Some(description)) => Ok(ValidCreate {
                service,
                lat,
                lng,
                address: self.address.trim().to_string(),
                description: description.to_string(),
                device_id: self.device_id.trim().to_string(),
                contact: Contact {
                    first_name: self.first_name.trim().to_string(),
                    last_name: self.last_name.trim().to_string(),
                    email: self.email.trim().to_string(),
                    phone: self.phone.trim().to_string(),
                },
            }),
            _ => Err(Error::Validation { fields: Vec::new() }),
        }
    }
}

#[derive(Debug)]
enum SearchBy {
    Report(ReportId),
    Device(String),
    Location,
}

#[derive(Debug)]
struct ValidSearch {
    by: SearchBy,
    point: Option<(f64, f64)>,
    area: Option<String>,
    radius_m: u32,
    max_results: usize,
}

impl SearchRequest {
    fn validate(&self) -> Result<ValidSearch> {
        let mut errors = Vec::new();
        let rid = text(&self.rid).and_then(|rid| match rid.parse::<ReportId>() {
            Ok(rid) => Some(rid),
            Err(_) => {
                errors.push(FieldError::new("rid", "not a valid report identifier"));
                None
            }
        });
        let point = coordinates(&self.lat, &self.lng, &mut errors);
        let radius_m = bounded(&self.radius, "radius", DEFAULT_RADIUS_M, 1, MAX_RADIUS_M, &mut errors);
        let max_results = bounded(
            &self.max_results,
            "max_results",
            DEFAULT_MAX_RESULTS,
            1,
            MAX_RESULTS,
            &mut errors,
        );
        finish_validation(errors)?;

        let by = if let Some(rid) = rid {
            SearchBy::Report(rid)
        } else if let Some(did) = text(&self.did) {
            SearchBy::Device(did.to_string())
        } else if point.is_some() {
            SearchBy::Location
        } else {
            return Err(Error::Validation {
                fields: vec![FieldError::new(
                    "query",
                    "one of rid, did, or valid lat/lng is required",
                )],
            });
        };

        Ok(ValidSearch {
            by,
            point,
            area: text(&self.area).map(str::to_string),
            radius_m,
            max_results,
        })
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineRequest for CreateRequest {
    const KIND: RequestKind = RequestKind::Create;
    type Response = CreateResponse;

    async fn process(&self, gateway: &Gateway, ctx: &mut RequestContext) -> Result<CreateResponse> {
        let valid = self.validate()?;
        ctx.enter(Stage::Validated);

        let route = valid.service.route.clone();
        ctx.set_area(&route.area);
        if !gateway.routing.validate_route(&route) {
            return Err(Error::NoRoute {
                area: route.area.to_string(),
            });
        }
        let service = gateway.cache.service(&valid.service).ok_or_else(|| Error::Validation {
            fields: vec![FieldError::new("mid", "unknown service")],
        })?;
        ctx.enter(Stage::Routed);

        let call = CreateReport {
            service: valid.service,
            service_name: service.name,
            lat: valid.lat,
            lng: valid.lng,
            address: valid.address,
            description: valid.description,
            device_id: valid.device_id,
            contact: valid.contact,
        };
        let mut receipt: Option<CreateReceipt> = None;
        gateway
            .dispatcher
            .run(
                ctx.request_id,
                &call,
                [DispatchTarget::route(route.clone())],
                |_, reply: CreateReceipt| receipt = Some(reply),
            )
            .await?;
        ctx.enter(Stage::Dispatched);

        let receipt = receipt.ok_or_else(|| Error::DispatchFailed {
            target: route.to_string(),
            message: "no acknowledgment".to_string(),
        })?;
        let report_id = ReportId::new(route.clone(), receipt.report_id).map_err(|err| {
            Error::DispatchFailed {
                target: route.to_string(),
                message: err.to_string(),
            }
        })?;
        ctx.enter(Stage::Merged);

        Ok(CreateResponse {
            message: "Created".to_string(),
            report_id,
            account_id: receipt.account_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineRequest for SearchRequest {
    const KIND: RequestKind = RequestKind::Search;
    type Response = SearchResponse;

    async fn process(&self, gateway: &Gateway, ctx: &mut RequestContext) -> Result<SearchResponse> {
        let valid = self.validate()?;
        ctx.enter(Stage::Validated);

        let (area, targets) = match &valid.by {
            SearchBy::Report(rid) => {
                if !gateway.routing.validate_route(&rid.route) {
                    return Err(Error::NoRoute {
                        area: rid.route.area.to_string(),
                    });
                }
                (rid.route.area.clone(), vec![rid.route.clone()])
            }
            SearchBy::Device(_) | SearchBy::Location => {
                let area = gateway.locate(valid.area.as_deref(), valid.point).await?;
                let routes = gateway.routes(&area)?;
                (area, routes)
            }
        };
        ctx.set_area(&area);
        ctx.enter(Stage::Routed);

        let targets: Vec<DispatchTarget> = targets.into_iter().map(DispatchTarget::route).collect();
        let mut merged: HashMap<ReportId, ReportRecord> = HashMap::new();
        let merge = |target: &DispatchTarget, reply: SearchReply| {
            let Some(route) = &target.route else {
                return;
            };
            for record in reply.reports {
                match ReportId::new(route.clone(), record.id.clone()) {
                    Ok(id) => {
                        merged.entry(id).or_insert(record);
                    }
                    Err(err) => warn!(target = %route, error = %err, "dropping report without id"),
                }
            }
        };
        let summary = match &valid.by {
            SearchBy::Report(rid) => {
                let call = SearchByReport {
                    report_id: rid.backend_id.clone(),
                };
                gateway.dispatcher.run(ctx.request_id, &call, targets, merge).await?
            }
            SearchBy::Device(device_id) => {
                let call = SearchByDevice {
                    device_id: device_id.clone(),
                    max_results: valid.max_results,
                };
                gateway.dispatcher.run(ctx.request_id, &call, targets, merge).await?
            }
            SearchBy::Location => {
                let (lat, lng) = valid.point.unwrap_or_default();
                let call = SearchByLocation {
                    lat,
                    lng,
                    radius_m: valid.radius_m,
                    max_results: valid.max_results,
                };
                gateway.dispatcher.run(ctx.request_id, &call, targets, merge).await?
            }
        };
        ctx.enter(Stage::Dispatched);

        let reports = rank(merged, valid.point, valid.max_results);
        ctx.enter(Stage::Merged);

        let unavailable = summary.failures.len();
        let message = if unavailable == 0 {
            format!("Found {} reports", reports.len())
        } else {
            format!(
                "Found {} reports; {} of {} backends unavailable",
                reports.len(),
                unavailable,
                summary.targets
            )
        };
        Ok(SearchResponse {
            message,
            area: Some(area),
            reports,
            unavailable,
        })
    }
}

/// Order merged reports by distance from `point` (then id) and keep the
/// closest `limit`.
fn rank(merged: HashMap<ReportId, ReportRecord>, point: Option<(f64, f64)>, limit: usize) -> Vec<Report> {
    let mut reports: Vec<Report> = merged
        .into_iter()
        .map(|(report_id, record)| Report {
            distance_m: point.map(|(lat, lng)| distance_m(lat, lng, record.lat, record.lng)),
            report_id,
            service_name: record.service_name,
            description: record.description,
            address: record.address,
            lat: record.lat,
            lng: record.lng,
            status: record.status,
            device_id: record.device_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
        .collect();
    reports.sort_by(|a, b| {
        let by_distance = match (a.distance_m, b.distance_m) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            _ => CmpOrdering::Equal,
        };
        by_distance.then_with(|| a.report_id.cmp(&b.report_id))
    });
    reports.truncate(limit);
    reports
}

/// Great-circle distance in meters.
pub fn distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineRequest for ServicesRequest {
    const KIND: RequestKind = RequestKind::Services;
    type Response = ServicesResponse;

    async fn process(&self, gateway: &Gateway, ctx: &mut RequestContext) -> Result<ServicesResponse> {
        let mut errors = Vec::new();
        let point = coordinates(&self.lat, &self.lng, &mut errors);
        finish_validation(errors)?;
        let alias = text(&self.area);
        if alias.is_none() && point.is_none() {
            return Err(Error::Validation {
                fields: vec![FieldError::new("area", "area or coordinates are required")],
            });
        }
        ctx.enter(Stage::Validated);

        let area = gateway.locate(alias, point).await?;
        ctx.set_area(&area);
        let snapshot = gateway.cache.snapshot();
        if let Some(services) = snapshot.services(&area).filter(|s| !s.is_empty()) {
            ctx.enter(Stage::Routed);
            ctx.enter(Stage::Dispatched);
            ctx.enter(Stage::Merged);
            return Ok(ServicesResponse {
                message: format!("{} services", services.len()),
                area,
                generation: snapshot.number(),
                services: services.to_vec(),
            });
        }

        // Routable but not in the cache yet: ask the area's providers directly.
        let routes = gateway.routes(&area)?;
        ctx.enter(Stage::Routed);

        let mut services: Vec<Service> = gateway
            .routing
            .providers()
            .filter(|p| p.route.area == area && p.catalog == CatalogSource::Seed)
            .flat_map(|p| {
                p.seed_services.iter().map(|seed| Service {
                    id: p.route.service(seed.code),
                    name: seed.name.clone(),
                    categories: seed.categories.clone(),
                    description: seed.description.clone(),
                })
            })
            .collect();
        let live: Vec<DispatchTarget> = routes
            .into_iter()
            .filter(|route| {
                gateway
                    .routing
                    .provider(route)
                    .is_some_and(|p| p.catalog == CatalogSource::Live)
            })
            .map(DispatchTarget::route)
            .collect();

        if !live.is_empty() {
            let call = ServicesArea { area: area.clone() };
            let dispatched = gateway
                .dispatcher
                .run(ctx.request_id, &call, live, |target, reply: CatalogReply| {
                    let Some(route) = &target.route else {
                        return;
                    };
                    for entry in reply.services {
                        if entry.area != route.area || entry.provider != route.provider {
                            continue;
                        }
                        services.push(Service {
                            id: route.service(entry.code),
                            name: entry.name,
                            categories: entry.categories,
                            description: entry.description,
                        });
                    }
                })
                .await;
            // Seed services still answer when every live provider is down.
            if let Err(err) = dispatched {
                if services.is_empty() {
                    return Err(err);
                }
                warn!(request_id = ctx.request_id, area = %area, error = %err, "live catalog unavailable; serving seed services");
            }
        }
        ctx.enter(Stage::Dispatched);

        services.sort_by(|a, b| (a.id.provider(), a.id.code).cmp(&(b.id.provider(), b.id.code)));
        services.dedup_by(|a, b| a.id == b.id);
        if services.is_empty() {
            return Err(Error::AreaNotServiced {
                area: area.to_string(),
            });
        }
        ctx.enter(Stage::Merged);

        Ok(ServicesResponse {
            message: format!("{} services", services.len()),
            area,
            generation: snapshot.number(),
            services,
        })
    }
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineRequest for RefreshRequest {
    const KIND: RequestKind = RequestKind::Refresh;
    type Response = RefreshSummary;

    async fn process(&self, gateway: &Gateway, ctx: &mut RequestContext) -> Result<RefreshSummary> {
        ctx.enter(Stage::Validated);
        ctx.enter(Stage::Routed);
        let summary = gateway.cache.refresh(&gateway.dispatcher, ctx.request_id).await?;
        ctx.enter(Stage::Dispatched);
        ctx.enter(Stage::Merged);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcMethod;
    use crate::telemetry::TelemetryEvent;
    use crate::test_helpers::{
        fixture_gateway, script_sj_catalogs, search_reply, Behavior, MockTransport, RecordingTelemetry,
    };

    fn setup() -> (Arc<MockTransport>, Arc<RecordingTelemetry>, Gateway) {
        let mock = Arc::new(MockTransport::new());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let gateway = fixture_gateway(&mock, &telemetry);
        (mock, telemetry, gateway)
    }

    fn create_request(mid: &str) -> CreateRequest {
        CreateRequest {
            mid: mid.to_string(),
            lat: "37.3382".to_string(),
            lng: "-121.8863".to_string(),
            description: "Deep pothole in the bike lane".to_string(),
            ..CreateRequest::default()
        }
    }

    fn fields(err: &Error) -> Vec<String> {
        match err {
            Error::Validation { fields } => fields.iter().map(|f| f.field.clone()).collect(),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_returns_routed_report_id() {
        let (mock, _, gateway) = setup();
        script_sj_catalogs(&mock);
        gateway.refresh().await.unwrap();
        mock.on(
            "CS1",
            RpcMethod::ReportCreate,
            Behavior::Reply(serde_json::json!({"report_id": "88121"})),
        );

        let response = gateway.create(&create_request("CS1.SJ.3.10")).await.unwrap();
        assert_eq!(response.message, "Created");
        assert_eq!(response.report_id.to_string(), "CS1.SJ.3.88121");

        let calls = mock.calls_for(RpcMethod::ReportCreate);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].route.as_deref(), Some("CS1.SJ.3"));
        assert_eq!(calls[0].params["service_name"], "Pothole");
    }

    #[tokio::test]
    async fn create_against_unreachable_adapter_fails() {
        let (mock, telemetry, gateway) = setup();
        script_sj_catalogs(&mock);
        gateway.refresh().await.unwrap();
        mock.on("CS1", RpcMethod::ReportCreate, Behavior::Fail("connection refused".into()));

        let err = gateway.create(&create_request("CS1.SJ.3.10")).await.unwrap_err();
        assert!(err.is_dispatch_error());

        let last = telemetry.request_events().pop().unwrap();
        assert_eq!(last.kind, RequestKind::Create);
        assert_eq!(last.status, Status::Error);
        assert_eq!(last.failed_at, Some(Stage::Dispatched));
        assert_eq!(last.area.as_deref(), Some("SJ"));
    }

    #[tokio::test]
    async fn create_reports_every_invalid_field() {
        let (_, telemetry, gateway) = setup();
        let request = CreateRequest {
            mid: "CS1.SJ.x.10".to_string(),
            lat: "91".to_string(),
            lng: "-121.8".to_string(),
            ..CreateRequest::default()
        };
        let err = gateway.create(&request).await.unwrap_err();
        assert_eq!(fields(&err), vec!["mid", "lat", "description"]);

        let last = telemetry.request_events().pop().unwrap();
        assert_eq!(last.failed_at, Some(Stage::Validated));
    }

    #[tokio::test]
    async fn create_rejects_service_missing_from_catalog() {
        let (mock, _, gateway) = setup();
        script_sj_catalogs(&mock);
        gateway.refresh().await.unwrap();

        let err = gateway.create(&create_request("CS1.SJ.3.99")).await.unwrap_err();
        assert_eq!(fields(&err), vec!["mid"]);
        let err = gateway.create(&create_request("CS1.OAK.1.1")).await.unwrap_err();
        assert!(matches!(err, Error::NoRoute { .. }));
        assert!(mock.calls_for(RpcMethod::ReportCreate).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn area_search_keeps_results_when_one_backend_times_out() {
        let (mock, _, gateway) = setup();
        mock.on("CS1", RpcMethod::ReportSearchLL, search_reply(&["101", "102"]));
        mock.on("SC2", RpcMethod::ReportSearchLL, Behavior::Hang);

        let request = SearchRequest {
            lat: "37.3382".to_string(),
            lng: "-121.8863".to_string(),
            ..SearchRequest::default()
        };
        let response = gateway.search(&request).await.expect("partial results");
        let ids: Vec<String> = response.reports.iter().map(|r| r.report_id.to_string()).collect();
        assert_eq!(ids, vec!["CS1.SJ.3.101", "CS1.SJ.3.102"]);
        assert_eq!(response.unavailable, 1);
        assert_eq!(response.area.unwrap().as_str(), "SJ");
    }

    #[tokio::test]
    async fn search_merges_dedups_and_truncates() {
        let (mock, _, gateway) = setup();
        mock.on("CS1", RpcMethod::ReportSearchLL, search_reply(&["1", "2", "1"]));
        mock.on("SC2", RpcMethod::ReportSearchLL, search_reply(&["7", "8"]));

        let request = SearchRequest {
            lat: "37.3382".to_string(),
            lng: "-121.8863".to_string(),
            max_results: "3".to_string(),
            radius: "250".to_string(),
            ..SearchRequest::default()
        };
        let response = gateway.search(&request).await.unwrap();
        let ids: Vec<String> = response.reports.iter().map(|r| r.report_id.to_string()).collect();
        // Both backends place their first result at the query point.
        assert_eq!(ids, vec!["CS1.SJ.3.1", "SC2.SJ.1.7", "CS1.SJ.3.2"]);
        assert_eq!(response.unavailable, 0);

        let params = &mock.calls_for(RpcMethod::ReportSearchLL)[0].params;
        assert_eq!(params["radius_m"], 250);
        assert_eq!(params["max_results"], 3);
    }

    #[tokio::test]
    async fn report_id_search_targets_its_route_only() {
        let (mock, _, gateway) = setup();
        mock.on("SC2", RpcMethod::ReportSearchRID, search_reply(&["A-17.2"]));

        let request = SearchRequest {
            rid: "SC2.SJ.1.A-17.2".to_string(),
            ..SearchRequest::default()
        };
        let response = gateway.search(&request).await.unwrap();
        assert_eq!(response.reports.len(), 1);
        assert_eq!(response.reports[0].report_id.backend_id, "A-17.2");

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params["report_id"], "A-17.2");
    }

    #[tokio::test]
    async fn device_search_needs_an_area() {
        let (mock, _, gateway) = setup();
        mock.on_any("CS1", search_reply(&["5"]));
        mock.on_any("SC2", search_reply(&[]));

        let mut request = SearchRequest {
            did: "device-42".to_string(),
            ..SearchRequest::default()
        };
        let err = gateway.search(&request).await.unwrap_err();
        assert_eq!(fields(&err), vec!["area"]);

        request.area = "San Jose CA".to_string();
        let response = gateway.search(&request).await.unwrap();
        assert_eq!(response.reports.len(), 1);
        assert_eq!(mock.calls_for(RpcMethod::ReportSearchDID).len(), 2);
    }

    #[tokio::test]
    async fn search_without_any_key_is_rejected() {
        let (_, _, gateway) = setup();
        let request = SearchRequest {
            lat: "0".to_string(),
            lng: "0".to_string(),
            radius: "9000".to_string(),
            ..SearchRequest::default()
        };
        let err = gateway.search(&request).await.unwrap_err();
        assert_eq!(fields(&err), vec!["radius"]);

        let err = gateway.search(&SearchRequest::default()).await.unwrap_err();
        assert_eq!(fields(&err), vec!["query"]);
    }

    #[tokio::test]
    async fn search_outside_every_area_is_a_client_error() {
        let (_, _, gateway) = setup();
        let request = SearchRequest {
            lat: "40.7128".to_string(),
            lng: "-74.0060".to_string(),
            ..SearchRequest::default()
        };
        let err = gateway.search(&request).await.unwrap_err();
        assert!(matches!(err, Error::Geocode { .. }));
    }

    #[tokio::test]
    async fn services_come_from_cache_after_refresh() {
        let (mock, _, gateway) = setup();
        script_sj_catalogs(&mock);
        gateway.refresh().await.unwrap();
        let before = mock.calls().len();

        let response = gateway
            .services(&ServicesRequest {
                area: "san jose".to_string(),
                ..ServicesRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.area.as_str(), "SJ");
        assert_eq!(response.generation, 1);
        assert_eq!(response.services.len(), 6);
        assert_eq!(mock.calls().len(), before);
    }

    #[tokio::test]
    async fn services_fall_back_to_live_dispatch_before_first_refresh() {
        let (mock, _, gateway) = setup();
        mock.on(
            "CS1",
            RpcMethod::ServicesArea,
            Behavior::Reply(serde_json::json!({"services": [
                {"area": "SJ", "provider": 3, "code": 10, "name": "Pothole"}
            ]})),
        );
        mock.on("SC2", RpcMethod::ServicesArea, Behavior::Fail("down".into()));

        let response = gateway
            .services(&ServicesRequest {
                lat: "37.3382".to_string(),
                lng: "-121.8863".to_string(),
                ..ServicesRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.generation, 0);
        assert_eq!(response.services.len(), 1);
        assert_eq!(response.services[0].id.to_string(), "CS1.SJ.3.10");
    }

    #[tokio::test]
    async fn request_ids_increase_and_lifecycle_is_reported() {
        let (mock, telemetry, gateway) = setup();
        script_sj_catalogs(&mock);
        gateway.refresh().await.unwrap();
        gateway
            .services(&ServicesRequest {
                area: "OAK".to_string(),
                ..ServicesRequest::default()
            })
            .await
            .unwrap();

        let requests = telemetry.request_events();
        let summary: Vec<(u64, RequestKind, Status)> =
            requests.iter().map(|e| (e.request_id, e.kind, e.status)).collect();
        assert_eq!(
            summary,
            vec![
                (1, RequestKind::Refresh, Status::Open),
                (1, RequestKind::Refresh, Status::Done),
                (2, RequestKind::Services, Status::Open),
                (2, RequestKind::Services, Status::Done),
            ]
        );
        assert_eq!(requests[3].area.as_deref(), Some("OAK"));

        // Dispatch events of the refresh carry the same request id.
        assert!(telemetry
            .events()
            .iter()
            .any(|e| matches!(e, TelemetryEvent::Rpc(rpc) if rpc.request_id == 1)));
    }

    #[test]
    fn distance_is_zero_for_same_point() {
        assert!(distance_m(37.3, -121.9, 37.3, -121.9).abs() < 1e-6);
        let one_degree = distance_m(0.0, 0.0, 1.0, 0.0);
        assert!((one_degree - 111_195.0).abs() < 100.0);
    }
}
