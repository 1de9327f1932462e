//! Flight-path documents built from stored path samples.
//!
//! The document is a GeoJSON `FeatureCollection`: one `LineString` for the
//! route (altitude converted to meters as the third coordinate) and one
//! `Point` per endpoint, with a summary in the route's properties.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::geo::haversine_distance;
use crate::store::PathSample;

/// Label used for an endpoint that could not be geocoded
pub const UNKNOWN_LOCATION: &str = "Unknown location";

const FEET_TO_METERS: f64 = 0.3048;

/// Format duration in seconds to human-readable string
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Format distance in meters to human-readable string with nm and km
pub fn format_distance(meters: f64) -> String {
    let nm = meters / 1852.0;
    let km = meters / 1000.0;

    if nm >= 1.0 {
        format!("{:.1} nm ({:.1} km)", nm, km)
    } else {
        format!("{:.0} m", meters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub icao: String,
    pub call_sign: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: String,
    pub distance_m: f64,
    pub origin: String,
    pub destination: String,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct RouteDocument {
    pub summary: RouteSummary,
    pub geojson: Value,
}

/// Accumulates samples one batch at a time, oldest first
#[derive(Debug, Default)]
pub struct RouteBuilder {
    coordinates: Vec<[f64; 3]>,
    first: Option<PathSample>,
    last: Option<PathSample>,
    distance_m: f64,
}

impl RouteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: &PathSample) {
        if let Some(last) = &self.last {
            self.distance_m +=
                haversine_distance(last.latitude, last.longitude, sample.latitude, sample.longitude);
        }
        if self.first.is_none() {
            self.first = Some(sample.clone());
        }
        self.coordinates.push([
            sample.longitude,
            sample.latitude,
            (sample.altitude as f64 * FEET_TO_METERS).round(),
        ]);
        self.last = Some(sample.clone());
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// `None` with fewer than two samples: a single point is not a route
    pub fn finish(
        self,
        icao: &str,
        call_sign: Option<&str>,
        origin: &str,
        destination: &str,
    ) -> Option<RouteDocument> {
        if self.coordinates.len() < 2 {
            return None;
        }
        let first = self.first?;
        let last = self.last?;

        let summary = RouteSummary {
            icao: icao.to_string(),
            call_sign: call_sign.map(str::to_string),
            started_at: first.recorded_at,
            ended_at: last.recorded_at,
            duration: format_duration((last.recorded_at - first.recorded_at).num_seconds()),
            distance_m: self.distance_m.round(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            samples: self.coordinates.len(),
        };

        let geojson = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "LineString",
                        "coordinates": self.coordinates,
                    },
                    "properties": summary,
                },
                endpoint("origin", origin, &first),
                endpoint("destination", destination, &last),
            ],
        });

        Some(RouteDocument { summary, geojson })
    }
}

fn endpoint(role: &str, label: &str, sample: &PathSample) -> Value {
    json!({
        "type": "Feature",
        "geometry": {
            "type": "Point",
            "coordinates": [sample.longitude, sample.latitude],
        },
        "properties": {
            "role": role,
            "label": label,
            "altitude_ft": sample.altitude,
            "recorded_at": sample.recorded_at,
        },
    })
}
