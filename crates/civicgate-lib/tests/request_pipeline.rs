mod common;

use std::sync::Arc;
use std::time::Duration;

use civicgate_lib::{
    CreateRequest, Error, RequestKind, RpcMethod, RpcScope, SearchRequest, Stage, Status,
    TelemetryEvent,
};
use civicgate_lib::test_helpers::{
    script_sj_catalogs, search_reply, Behavior, MockTransport, RecordingTelemetry,
};
use common::gateway;
use serde_json::json;

fn downtown() -> (String, String) {
    ("37.3382".to_string(), "-121.8863".to_string())
}

#[tokio::test(start_paused = true)]
async fn area_search_tolerates_a_silent_backend() {
    let mock = Arc::new(MockTransport::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    mock.on(
        "CS1",
        RpcMethod::ReportSearchLL,
        search_reply(&["101", "102"]),
    );
    mock.on("SC2", RpcMethod::ReportSearchLL, Behavior::Hang);
    let gateway = gateway(&mock, &telemetry);

    let (lat, lng) = downtown();
    let started = tokio::time::Instant::now();
    let response = gateway
        .search(&SearchRequest {
            lat,
            lng,
            ..SearchRequest::default()
        })
        .await
        .expect("partial search succeeds");

    assert!(started.elapsed() < Duration::from_millis(400));
    let ids: Vec<String> = response
        .reports
        .iter()
        .map(|r| r.report_id.to_string())
        .collect();
    assert_eq!(ids, vec!["CS1.SJ.3.101", "CS1.SJ.3.102"]);
    assert_eq!(response.unavailable, 1);

    let timed_out = telemetry.events().into_iter().any(|event| {
        matches!(event, TelemetryEvent::Rpc(rpc)
            if rpc.scope == RpcScope::Target && rpc.status == Status::Error && rpc.route == "SC2.SJ.1")
    });
    assert!(timed_out);
}

#[tokio::test]
async fn create_to_unreachable_adapter_surfaces_failure() {
    let mock = Arc::new(MockTransport::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    script_sj_catalogs(&mock);
    mock.on("SC2", RpcMethod::ReportCreate, Behavior::Fail("connection refused".into()));
    let gateway = gateway(&mock, &telemetry);
    gateway.refresh().await.unwrap();

    let (lat, lng) = downtown();
    let err = gateway
        .create(&CreateRequest {
            mid: "SC2.SJ.1.20".to_string(),
            lat,
            lng,
            description: "Tagging on the underpass".to_string(),
            ..CreateRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DispatchFailed { ref target, .. } if target == "SC2.SJ.1"));

    let failed = telemetry.events().into_iter().rev().find_map(|event| match event {
        TelemetryEvent::Request(req) if req.kind == RequestKind::Create => Some(req),
        _ => None,
    });
    let failed = failed.expect("create request event");
    assert_eq!(failed.status, Status::Error);
    assert_eq!(failed.failed_at, Some(Stage::Dispatched));
}

#[tokio::test]
async fn create_against_seed_catalog() {
    let mock = Arc::new(MockTransport::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    script_sj_catalogs(&mock);
    mock.on(
        "EM1",
        RpcMethod::ReportCreate,
        Behavior::Reply(json!({"report_id": "mail-0001"})),
    );
    let gateway = gateway(&mock, &telemetry);
    gateway.refresh().await.unwrap();

    let response = gateway
        .create(&CreateRequest {
            mid: "EM1.OAK.1.2".to_string(),
            lat: "37.8044".to_string(),
            lng: "-122.2712".to_string(),
            description: "Couch on the sidewalk".to_string(),
            email: "resident@example.org".to_string(),
            ..CreateRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.message, "Created");
    assert_eq!(response.report_id.to_string(), "EM1.OAK.1.mail-0001");
}

#[tokio::test]
async fn device_search_covers_every_route_in_area() {
    let mock = Arc::new(MockTransport::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    mock.on(
        "CS1",
        RpcMethod::ReportSearchDID,
        search_reply(&["7"]),
    );
    mock.on(
        "SC2",
        RpcMethod::ReportSearchDID,
        search_reply(&["3"]),
    );
    let gateway = gateway(&mock, &telemetry);

    let response = gateway
        .search(&SearchRequest {
            did: "phone-1234".to_string(),
            area: "sj".to_string(),
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    // No query point: results are ordered by id.
    let ids: Vec<String> = response
        .reports
        .iter()
        .map(|r| r.report_id.to_string())
        .collect();
    assert_eq!(ids, vec!["CS1.SJ.3.7", "SC2.SJ.1.3"]);
    assert!(response.reports.iter().all(|r| r.distance_m.is_none()));
}

#[tokio::test]
async fn every_backend_failing_fails_the_search() {
    let mock = Arc::new(MockTransport::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    mock.on("CS1", RpcMethod::ReportSearchLL, Behavior::Fail("down".into()));
    mock.on("SC2", RpcMethod::ReportSearchLL, Behavior::Fail("down".into()));
    let gateway = gateway(&mock, &telemetry);

    let (lat, lng) = downtown();
    let err = gateway
        .search(&SearchRequest {
            lat,
            lng,
            ..SearchRequest::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_dispatch_error());
}
