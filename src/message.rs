//! Normalized telemetry message
//!
//! Messages are produced by upstream decoders (Beast, SBS, aggregator pollers)
//! and are independent of the wire format they came from. Optional fields are
//! presence flags: `None` means "no update in this message", never "cleared".
//!
//! Numeric fields keep the decoder's textual representation; the typed
//! accessors parse them so a malformed value is reported against the field
//! it came from.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, TrackerError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Name of the source that produced this message (e.g. "beast", "sbs")
    pub source: String,
    /// ICAO 24-bit address as a 6 character hex string
    pub icao: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_rate: Option<String>,
    #[serde(default)]
    pub is_on_ground: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<String>,
    /// SBS transmission type (MSG,1 .. MSG,8) when the source knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transmission_type: Option<u8>,
}

fn parse_field<T: FromStr>(field: &'static str, raw: Option<&String>) -> Result<Option<T>> {
    match raw.map(|s| s.trim()) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| TrackerError::InvalidField {
                field,
                value: value.to_string(),
            }),
    }
}

impl Message {
    pub fn new(source: impl Into<String>, icao: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            icao: icao.into(),
            ..Default::default()
        }
    }

    /// Canonical registry key: upper-case hex without surrounding whitespace
    pub fn icao_key(&self) -> String {
        self.icao.trim().to_ascii_uppercase()
    }

    /// Barometric altitude in feet
    pub fn altitude(&self) -> Result<Option<i32>> {
        parse_field("altitude", self.altitude.as_ref())
    }

    pub fn latitude(&self) -> Result<Option<f64>> {
        let latitude = parse_field::<f64>("latitude", self.latitude.as_ref())?;
        match latitude {
            Some(lat) if !(-90.0..=90.0).contains(&lat) => Err(TrackerError::InvalidField {
                field: "latitude",
                value: lat.to_string(),
            }),
            other => Ok(other),
        }
    }

    pub fn longitude(&self) -> Result<Option<f64>> {
        let longitude = parse_field::<f64>("longitude", self.longitude.as_ref())?;
        match longitude {
            Some(lon) if !(-180.0..=180.0).contains(&lon) => Err(TrackerError::InvalidField {
                field: "longitude",
                value: lon.to_string(),
            }),
            other => Ok(other),
        }
    }

    /// Position, only when both coordinates are present
    pub fn location(&self) -> Result<Option<(f64, f64)>> {
        match (self.latitude()?, self.longitude()?) {
            (Some(lat), Some(lon)) => Ok(Some((lat, lon))),
            _ => Ok(None),
        }
    }

    /// Vertical rate in feet per minute
    pub fn vertical_rate(&self) -> Result<Option<i32>> {
        parse_field("vertical_rate", self.vertical_rate.as_ref())
    }

    pub fn track(&self) -> Result<Option<f32>> {
        parse_field("track", self.track.as_ref())
    }

    /// Ground speed in knots
    pub fn ground_speed(&self) -> Result<Option<f32>> {
        parse_field("ground_speed", self.ground_speed.as_ref())
    }

    pub fn call_sign(&self) -> Option<&str> {
        self.call_sign
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn squawk(&self) -> Option<&str> {
        self.squawk.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}
