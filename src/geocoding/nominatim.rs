use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{ReverseGeocodeResult, ReverseGeocoder};
use crate::config::GeocoderSection;
use crate::geo::haversine_distance;

// Nominatim reverse geocoding response structure
#[derive(Debug, Deserialize)]
struct NominatimReverseResponse {
    #[serde(default)]
    lat: Option<String>,
    #[serde(default)]
    lon: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    address: Option<NominatimAddress>,
    /// Set instead of a result when nothing is near the point
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    town: Option<String>,
    #[serde(default)]
    village: Option<String>,
    #[serde(default)]
    suburb: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

impl NominatimAddress {
    /// "Town, State, Country" using whichever parts are known
    fn short_label(&self) -> Option<String> {
        // Pick the best city name (city > town > village > suburb)
        let place = self
            .city
            .as_ref()
            .or(self.town.as_ref())
            .or(self.village.as_ref())
            .or(self.suburb.as_ref());

        let parts: Vec<&str> = [place, self.state.as_ref(), self.country.as_ref()]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .collect();

        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

#[derive(Clone)]
pub struct NominatimClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    /// Rate limiter for Nominatim API (1 request per second)
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl NominatimClient {
    pub fn new(client: reqwest::Client, base_url: String, user_agent: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(config: &GeocoderSection) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self::new(
            client,
            config.base_url.clone(),
            config.user_agent.clone(),
        ))
    }

    /// Enforce Nominatim rate limit of 1 request per second
    /// This MUST be called before every Nominatim API request
    async fn enforce_rate_limit(&self) {
        let mut last_request = self.last_request.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            let min_interval = Duration::from_secs(1);

            if elapsed < min_interval {
                let sleep_duration = min_interval - elapsed;
                debug!(
                    "Nominatim rate limit: sleeping for {:?} to respect 1 req/sec limit",
                    sleep_duration
                );
                tokio::time::sleep(sleep_duration).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    /// Reverse geocode coordinates using Nominatim
    pub async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<ReverseGeocodeResult> {
        debug!(
            "Reverse geocoding coordinates with Nominatim: ({}, {})",
            latitude, longitude
        );

        self.enforce_rate_limit().await;

        let url = format!("{}/reverse", self.base_url);

        let params = [
            ("lat", latitude.to_string()),
            ("lon", longitude.to_string()),
            ("format", "json".to_string()),
            ("addressdetails", "1".to_string()),
            ("zoom", "10".to_string()),
        ];

        let response = self
            .client
            .get(&url)
            .query(&params)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send reverse geocoding request: {}", e))?;

        let status = response.status();

        if status == reqwest::StatusCode::FORBIDDEN {
            error!(latitude = %latitude, longitude = %longitude, "Nominatim reverse geocoding request forbidden (403) - possible rate limit violation");
            return Err(anyhow!(
                "Nominatim reverse geocoding request forbidden (403) for coordinates ({}, {})",
                latitude,
                longitude
            ));
        }

        if !status.is_success() {
            return Err(anyhow!(
                "Nominatim reverse geocoding request failed with status: {}",
                status
            ));
        }

        let result: NominatimReverseResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse reverse geocoding response: {}", e))?;

        Ok(to_result(result, latitude, longitude))
    }
}

fn to_result(
    response: NominatimReverseResponse,
    latitude: f64,
    longitude: f64,
) -> ReverseGeocodeResult {
    if let Some(reason) = response.error {
        debug!(latitude, longitude, reason = %reason, "Nominatim found nothing");
        return ReverseGeocodeResult::no_match();
    }

    let label = response
        .address
        .as_ref()
        .and_then(NominatimAddress::short_label)
        .or(response.display_name)
        .unwrap_or_default();

    let matched = response
        .lat
        .as_deref()
        .and_then(|lat| lat.parse::<f64>().ok())
        .zip(response.lon.as_deref().and_then(|lon| lon.parse::<f64>().ok()));
    let distance_m = matched
        .map(|(lat, lon)| haversine_distance(latitude, longitude, lat, lon))
        .unwrap_or(0.0);

    debug!(
        "Nominatim reverse geocoded ({}, {}) to '{}' ({:.0} m away)",
        latitude, longitude, label, distance_m
    );

    ReverseGeocodeResult { label, distance_m }
}

#[async_trait]
impl ReverseGeocoder for NominatimClient {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<ReverseGeocodeResult> {
        self.reverse_geocode(latitude, longitude).await
    }
}
