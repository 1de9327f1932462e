//! Persistence capability consumed by the tracker.
//!
//! The tracker never issues SQL itself; everything durable goes through
//! [`SightingStore`]. Mutating calls report how many rows they touched so
//! callers can notice when a row was closed or reopened underneath them.

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted identity of an aircraft, keyed by ICAO address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AircraftRecord {
    pub id: Uuid,
    pub icao: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted session of one project, opened once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One visible period of an aircraft within a project session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightingRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub aircraft_id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub call_sign: Option<String>,
    pub squawk: Option<String>,
}

impl SightingRecord {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

/// History entry for call signs, squawks and transmission types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord<T> {
    pub sighting_id: Uuid,
    pub value: T,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPathSample {
    pub sighting_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub altitude: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub vertical_rate: Option<i32>,
}

/// Stored flight-path sample; `id` is monotonically increasing in insertion order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSample {
    pub id: i64,
    pub sighting_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub altitude: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub vertical_rate: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightPathRecord {
    pub sighting_id: Uuid,
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SightingStore: Send + Sync {
    async fn open_session(&self, project: &str, now: DateTime<Utc>) -> Result<Session>;

    async fn close_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    async fn load_or_create_aircraft(&self, icao: &str, now: DateTime<Utc>)
    -> Result<AircraftRecord>;

    /// Most recently opened sighting row for this aircraft in this session
    async fn latest_sighting(
        &self,
        session_id: Uuid,
        aircraft_id: Uuid,
    ) -> Result<Option<SightingRecord>>;

    async fn create_sighting(
        &self,
        session_id: Uuid,
        aircraft_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SightingRecord>;

    /// Clear the closed timestamp of a sighting row
    async fn reopen_sighting(&self, sighting_id: Uuid) -> Result<u64>;

    /// Only open rows are updated
    async fn update_sighting_call_sign(&self, sighting_id: Uuid, call_sign: &str) -> Result<u64>;

    /// Only open rows are updated
    async fn update_sighting_squawk(&self, sighting_id: Uuid, squawk: &str) -> Result<u64>;

    async fn insert_call_sign(
        &self,
        sighting_id: Uuid,
        call_sign: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn insert_squawk(&self, sighting_id: Uuid, squawk: &str, now: DateTime<Utc>)
    -> Result<u64>;

    async fn insert_transmission_type(
        &self,
        sighting_id: Uuid,
        transmission_type: u8,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn insert_path_sample(&self, sample: NewPathSample) -> Result<u64>;

    /// Close many sighting rows in one transaction: either every row is
    /// closed or none is
    async fn close_sightings(&self, sighting_ids: &[Uuid], now: DateTime<Utc>) -> Result<u64>;

    /// Samples of one sighting with `id > after`, oldest first, at most `limit`
    async fn path_samples(
        &self,
        sighting_id: Uuid,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<PathSample>>;

    async fn flight_path(&self, sighting_id: Uuid) -> Result<Option<FlightPathRecord>>;

    async fn create_flight_path(
        &self,
        sighting_id: Uuid,
        document: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn update_flight_path(
        &self,
        sighting_id: Uuid,
        document: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}
