// Test-only helpers for `civicgate-lib` and the crates that depend on it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{
    AdapterConfig, AdapterKind, AreaConfig, Bounds, CatalogSource, GatewayConfig, ProviderConfig,
    SeedService,
};
use crate::error::{Error, Result};
use crate::geocode::BoundsGeocoder;
use crate::id::{AdapterId, AreaId, NRoute};
use crate::routing::{Adapter, RoutingTable};
use crate::rpc::{RpcMethod, RpcTransport};
use crate::telemetry::{RequestEvent, RpcEvent, TelemetryEvent, TelemetrySink};
use crate::Gateway;

/// Scripted reaction of a mock adapter.
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply(Value),
    Fail(String),
    /// Never answers; the dispatcher's deadline ends the call.
    Hang,
    Delay(Duration, Value),
}

/// A call observed by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub adapter: String,
    pub route: Option<String>,
    pub method: RpcMethod,
    pub params: Value,
}

/// In-memory transport answering from scripted behaviors.
///
/// Behaviors are looked up by `(route, method)`, `(adapter, method)`,
/// `(route, any)`, then `(adapter, any)`. Unscripted calls fail.
#[derive(Debug, Default)]
pub struct MockTransport {
    behaviors: Mutex<HashMap<(String, Option<RpcMethod>), Behavior>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `key` (adapter id or route token) for one method.
    pub fn on(&self, key: &str, method: RpcMethod, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert((key.to_string(), Some(method)), behavior);
    }

    /// Script `key` (adapter id or route token) for every method.
    pub fn on_any(&self, key: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert((key.to_string(), None), behavior);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, method: RpcMethod) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    fn behavior(&self, adapter: &str, route: Option<&str>, method: RpcMethod) -> Option<Behavior> {
        let behaviors = self.behaviors.lock().unwrap();
        let mut keys = Vec::new();
        if let Some(route) = route {
            keys.push((route.to_string(), Some(method)));
        }
        keys.push((adapter.to_string(), Some(method)));
        if let Some(route) = route {
            keys.push((route.to_string(), None));
        }
        keys.push((adapter.to_string(), None));
        keys.iter().find_map(|key| behaviors.get(key).cloned())
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(
        &self,
        adapter: &Adapter,
        route: Option<&NRoute>,
        method: RpcMethod,
        params: Value,
    ) -> Result<Value> {
        let route = route.map(ToString::to_string);
        self.calls.lock().unwrap().push(RecordedCall {
            adapter: adapter.id.to_string(),
            route: route.clone(),
            method,
            params,
        });
        let target = route.clone().unwrap_or_else(|| adapter.id.to_string());
        match self.behavior(adapter.id.as_str(), route.as_deref(), method) {
            Some(Behavior::Reply(value)) => Ok(value),
            Some(Behavior::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Behavior::Fail(message)) => Err(Error::DispatchFailed { target, message }),
            Some(Behavior::Hang) => std::future::pending().await,
            None => Err(Error::DispatchFailed {
                target,
                message: format!("no scripted behavior for {method}"),
            }),
        }
    }
}

/// Telemetry sink that keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn request_events(&self) -> Vec<RequestEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::Request(e) => Some(e),
                TelemetryEvent::Rpc(_) => None,
            })
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn send_rpc(&self, event: RpcEvent) {
        self.events.lock().unwrap().push(TelemetryEvent::Rpc(event));
    }

    fn send_request(&self, event: RequestEvent) {
        self.events.lock().unwrap().push(TelemetryEvent::Request(event));
    }
}

/// Reply carrying search results with the given backend ids, placed along a
/// line north of downtown San Jose so distance ordering follows the list.
pub fn search_reply(ids: &[&str]) -> Behavior {
    let reports: Vec<Value> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            json!({
                "id": id,
                "service_name": "Pothole",
                "description": format!("report {id}"),
                "lat": 37.3382 + 0.0001 * i as f64,
                "lng": -121.8863,
                "status": "open",
            })
        })
        .collect();
    Behavior::Reply(json!({ "reports": reports }))
}

/// Reply carrying a catalog of `(area, provider, code, name)` entries.
pub fn catalog_reply(entries: &[(&str, u32, u32, &str)]) -> Behavior {
    let services: Vec<Value> = entries
        .iter()
        .map(|(area, provider, code, name)| {
            json!({
                "area": area,
                "provider": provider,
                "code": code,
                "name": name,
                "categories": ["streets"],
            })
        })
        .collect();
    Behavior::Reply(json!({ "services": services }))
}

fn adapter(id: &str, kind: AdapterKind) -> AdapterConfig {
    AdapterConfig {
        id: AdapterId::new(id).unwrap(),
        name: format!("{id} adapter"),
        kind,
        address: format!("mock://{}", id.to_lowercase()),
        key: None,
    }
}

fn provider(id: u32, adapter: &str) -> ProviderConfig {
    ProviderConfig {
        id,
        adapter: AdapterId::new(adapter).unwrap(),
        name: format!("provider {id}"),
        catalog: CatalogSource::Live,
        services: Vec::new(),
    }
}

/// Fixture routing configuration.
///
/// - `SJ` (San Jose): `CS1` provider 3 and `SC2` provider 1, both live catalogs.
/// - `OAK` (Oakland): `EM1` provider 1 with a two-entry seed catalog.
pub fn fixture_config() -> GatewayConfig {
    let mut oakland_email = provider(1, "EM1");
    oakland_email.catalog = CatalogSource::Seed;
    oakland_email.services = vec![
        SeedService {
            code: 1,
            name: "Graffiti".to_string(),
            categories: vec!["blight".to_string()],
            description: None,
        },
        SeedService {
            code: 2,
            name: "Illegal dumping".to_string(),
            categories: vec!["blight".to_string()],
            description: Some("Furniture, mattresses, debris".to_string()),
        },
    ];

    GatewayConfig {
        adapters: vec![
            adapter("CS1", AdapterKind::CitySourced),
            adapter("SC2", AdapterKind::SeeClickFix),
            adapter("EM1", AdapterKind::Email),
        ],
        areas: vec![
            AreaConfig {
                id: AreaId::new("SJ").unwrap(),
                name: "San Jose".to_string(),
                aliases: vec!["san jose ca".to_string()],
                bounds: Some(Bounds {
                    min_lat: 37.12,
                    min_lng: -122.05,
                    max_lat: 37.47,
                    max_lng: -121.58,
                }),
                providers: vec![provider(3, "CS1"), provider(1, "SC2")],
            },
            AreaConfig {
                id: AreaId::new("OAK").unwrap(),
                name: "Oakland".to_string(),
                aliases: Vec::new(),
                bounds: Some(Bounds {
                    min_lat: 37.70,
                    min_lng: -122.35,
                    max_lat: 37.89,
                    max_lng: -122.11,
                }),
                providers: vec![oakland_email],
            },
        ],
    }
}

pub fn fixture_table() -> RoutingTable {
    RoutingTable::from_config(&fixture_config()).unwrap()
}

/// Script both live San Jose adapters with three catalog entries each.
pub fn script_sj_catalogs(mock: &MockTransport) {
    mock.on(
        "CS1",
        RpcMethod::ServicesAll,
        catalog_reply(&[
            ("SJ", 3, 10, "Pothole"),
            ("SJ", 3, 11, "Streetlight out"),
            ("SJ", 3, 12, "Abandoned vehicle"),
        ]),
    );
    mock.on(
        "SC2",
        RpcMethod::ServicesAll,
        catalog_reply(&[
            ("SJ", 1, 10, "Pothole"),
            ("SJ", 1, 20, "Graffiti"),
            ("SJ", 1, 21, "Sidewalk damage"),
        ]),
    );
}

/// A gateway over the fixture table with a mock transport and recorder.
pub fn fixture_gateway(
    mock: &Arc<MockTransport>,
    telemetry: &Arc<RecordingTelemetry>,
) -> Gateway {
    let table = Arc::new(fixture_table());
    let geocoder = BoundsGeocoder::from_table(&table);
    Gateway::builder(table)
        .transport(Arc::clone(mock) as Arc<dyn RpcTransport>)
        .telemetry(Arc::clone(telemetry) as Arc<dyn TelemetrySink>)
        .geocoder(Arc::new(geocoder))
        .deadline(Duration::from_millis(500))
        .build()
}
