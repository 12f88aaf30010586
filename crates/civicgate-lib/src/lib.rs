//! Civicgate core: routing and dispatch for the civic issue gateway.
//!
//! This crate owns the identifier scheme, the routing table built from
//! configuration, the refreshable service catalog cache, the concurrent RPC
//! dispatcher, and the request pipeline that ties them together behind
//! [`Gateway`]. HTTP services should only depend on the items exported here
//! instead of reimplementing routing or dispatch behavior.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod geocode;
pub mod id;
pub mod routing;
pub mod rpc;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

pub use cache::{Generation, RefreshSummary, Service, ServiceCache};
pub use config::{AdapterConfig, AdapterKind, AreaConfig, Bounds, GatewayConfig, ProviderConfig};
pub use dispatch::{DispatchSummary, DispatchTarget, Dispatcher, DEFAULT_DEADLINE};
pub use error::{Error, FieldError, Result};
pub use gateway::{
    CreateRequest, CreateResponse, Gateway, GatewayBuilder, Report, SearchRequest, SearchResponse,
    ServicesRequest, ServicesResponse, Stage,
};
pub use geocode::{BoundsGeocoder, Geocoder};
pub use id::{parse_mid, AdapterId, AreaId, NRoute, ProviderId, ReportId, ServiceCode, ServiceId};
pub use routing::{Adapter, Area, Provider, RoutingTable};
pub use rpc::{HttpTransport, RpcMethod, RpcTransport};
pub use telemetry::{
    ChannelTelemetry, NoopTelemetry, RequestEvent, RequestKind, RpcEvent, RpcScope, Status,
    TelemetryEvent, TelemetrySink, TracingTelemetry,
};
