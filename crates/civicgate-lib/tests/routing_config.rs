mod common;

use std::io::Write;

use civicgate_lib::{parse_mid, AreaId, Error, GatewayConfig, RoutingTable};
use common::{fixture_config_path, fixture_table};

#[test]
fn fixture_builds_expected_table() {
    let table = fixture_table();
    let sj = AreaId::new("SJ").unwrap();

    let adapters: Vec<String> = table
        .adapters_for_area(&sj)
        .unwrap()
        .iter()
        .map(|a| a.id.to_string())
        .collect();
    assert_eq!(adapters, vec!["CS1", "SC2"]);

    for alias in ["san jose", "San Jose", "  SANJOSE ", "sj"] {
        assert_eq!(table.resolve_area(alias).unwrap(), sj, "alias {alias:?}");
    }
    assert!(matches!(
        table.resolve_area("Atlantis"),
        Err(Error::UnknownArea { .. })
    ));
}

#[test]
fn canonical_ids_resolve_to_themselves() {
    let table = fixture_table();
    for area in table.areas() {
        let resolved = table.resolve_area(area.id.as_str()).unwrap();
        assert_eq!(table.resolve_area(resolved.as_str()).unwrap(), resolved);
    }
}

#[test]
fn embedded_routes_are_checked_against_the_table() {
    let table = fixture_table();
    assert!(table.validate_route(&parse_mid("CS1.SJ.3.42").unwrap().route));
    assert!(table.validate_route(&parse_mid("EM1.OAK.1.1").unwrap().route));
    assert!(!table.validate_route(&parse_mid("EM1.SJ.1.1").unwrap().route));
    assert!(!table.validate_route(&parse_mid("XX9.SJ.3.1").unwrap().route));
}

#[test]
fn conflicting_alias_is_fatal() {
    let raw = std::fs::read_to_string(fixture_config_path()).unwrap();
    let broken = raw.replace(
        "id = \"OAK\"\nname = \"Oakland\"",
        "id = \"OAK\"\nname = \"Oakland\"\naliases = [\"San Jose CA\"]",
    );
    assert_ne!(raw, broken);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(broken.as_bytes()).unwrap();
    let config = GatewayConfig::from_path(file.path()).unwrap();
    assert!(matches!(
        RoutingTable::from_config(&config),
        Err(Error::Config { .. })
    ));
}

#[test]
fn missing_file_is_io_error() {
    let err = GatewayConfig::from_path(std::path::Path::new("/nonexistent/routing.toml")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
