//! Reverse geocoding of sighting endpoints.

mod nominatim;

pub use nominatim::NominatimClient;

use anyhow::Result;
use async_trait::async_trait;

/// Result of a reverse geocode lookup.
///
/// An empty `label` means the service had nothing near the point; that is
/// not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReverseGeocodeResult {
    pub label: String,
    /// Distance in meters between the queried point and the matched place
    pub distance_m: f64,
}

impl ReverseGeocodeResult {
    pub fn no_match() -> Self {
        Self::default()
    }

    pub fn is_match(&self) -> bool {
        !self.label.trim().is_empty()
    }
}

/// Trait for services that turn coordinates into a human-readable place
///
/// Most services use nearest-point matching rather than point-in-polygon
/// containment, hence the distance in the result.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    /// * `latitude` - Latitude in WGS84 (-90.0 to 90.0)
    /// * `longitude` - Longitude in WGS84 (-180.0 to 180.0)
    async fn reverse_geocode(&self, latitude: f64, longitude: f64)
    -> Result<ReverseGeocodeResult>;
}

/// Used when no geocoder is configured
#[derive(Debug, Default)]
pub struct NoopGeocoder;

#[async_trait]
impl ReverseGeocoder for NoopGeocoder {
    async fn reverse_geocode(
        &self,
        _latitude: f64,
        _longitude: f64,
    ) -> Result<ReverseGeocodeResult> {
        Ok(ReverseGeocodeResult::no_match())
    }
}
