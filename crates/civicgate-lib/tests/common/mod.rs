//! Fixture helpers shared by the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use civicgate_lib::test_helpers::{MockTransport, RecordingTelemetry};
use civicgate_lib::{Gateway, GatewayConfig, RoutingTable, RpcTransport, TelemetrySink};

/// Path to the routing fixture.
pub fn fixture_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../docs/fixtures/routing.toml")
}

pub fn fixture_table() -> RoutingTable {
    let config = GatewayConfig::from_path(&fixture_config_path()).expect("fixture config loads");
    RoutingTable::from_config(&config).expect("fixture config is valid")
}

/// A gateway over the file fixture with a short dispatch deadline.
pub fn gateway(mock: &Arc<MockTransport>, telemetry: &Arc<RecordingTelemetry>) -> Gateway {
    Gateway::builder(Arc::new(fixture_table()))
        .transport(Arc::clone(mock) as Arc<dyn RpcTransport>)
        .telemetry(Arc::clone(telemetry) as Arc<dyn TelemetrySink>)
        .deadline(Duration::from_millis(300))
        .build()
}
