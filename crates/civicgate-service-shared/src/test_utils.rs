//! Test utilities for gateway handler testing.
//!
//! States are built over the fixture routing table with a scripted transport,
//! so handlers can be exercised without live adapters.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use civicgate_lib::test_helpers::{
    fixture_gateway, script_sj_catalogs, MockTransport, RecordingTelemetry,
};

use crate::state::AppState;

/// Path to the fixture routing configuration.
pub const TEST_FIXTURE_PATH: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../docs/fixtures/routing.toml"
);

pub fn fixture_config_path() -> PathBuf {
    PathBuf::from(TEST_FIXTURE_PATH)
}

/// Fresh state with an unscripted transport and an empty catalog.
pub fn test_state() -> (AppState, Arc<MockTransport>, Arc<RecordingTelemetry>) {
    let mock = Arc::new(MockTransport::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    let gateway = fixture_gateway(&mock, &telemetry);
    (AppState::from_gateway(gateway), mock, telemetry)
}

/// Like [`test_state`], with both San Jose catalogs scripted so a refresh
/// succeeds.
pub fn scripted_state() -> (AppState, Arc<MockTransport>, Arc<RecordingTelemetry>) {
    let (state, mock, telemetry) = test_state();
    script_sj_catalogs(&mock);
    (state, mock, telemetry)
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique request id for tests.
pub fn test_request_id() -> String {
    format!("test-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}
