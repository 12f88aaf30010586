//! Reverse-geocoding boundary: coordinates to a city name.
//!
//! The pipeline resolves the returned name through the routing table's alias
//! index, so any geocoder returning a configured alias works.

use async_trait::async_trait;

use crate::config::Bounds;
use crate::error::{Error, Result};
use crate::routing::RoutingTable;

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn city_for_coordinates(&self, lat: f64, lng: f64) -> Result<String>;
}

/// Resolves coordinates against the bounding boxes configured on areas.
///
/// Boxes are checked in area id order; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct BoundsGeocoder {
    regions: Vec<(String, Bounds)>,
}

impl BoundsGeocoder {
    pub fn new(regions: Vec<(String, Bounds)>) -> Self {
        Self { regions }
    }

    /// Build from every area in the table that declares `bounds`.
    pub fn from_table(table: &RoutingTable) -> Self {
        let regions = table
            .areas()
            .filter_map(|area| area.bounds.map(|b| (area.name.clone(), b)))
            .collect();
        Self { regions }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[async_trait]
impl Geocoder for BoundsGeocoder {
    async fn city_for_coordinates(&self, lat: f64, lng: f64) -> Result<String> {
        self.regions
            .iter()
            .find(|(_, bounds)| bounds.contains(lat, lng))
            .map(|(name, _)| name.clone())
            .ok_or(Error::Geocode { lat, lng })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixture_table;

    #[tokio::test]
    async fn finds_city_for_point_inside_bounds() {
        let geocoder = BoundsGeocoder::from_table(&fixture_table());
        assert_eq!(geocoder.len(), 2);
        let city = geocoder.city_for_coordinates(37.3382, -121.8863).await.unwrap();
        assert_eq!(city, "San Jose");
        let city = geocoder.city_for_coordinates(37.8044, -122.2712).await.unwrap();
        assert_eq!(city, "Oakland");
    }

    #[tokio::test]
    async fn point_outside_every_area_fails() {
        let geocoder = BoundsGeocoder::from_table(&fixture_table());
        assert!(matches!(
            geocoder.city_for_coordinates(40.7128, -74.0060).await,
            Err(Error::Geocode { .. })
        ));
    }
}
