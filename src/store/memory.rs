use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AircraftRecord, FlightPathRecord, HistoryRecord, NewPathSample, PathSample, Session,
    SightingRecord, SightingStore,
};

#[derive(Debug, Default)]
struct Tables {
    sessions: BTreeMap<Uuid, Session>,
    sightings: BTreeMap<Uuid, SightingRecord>,
    call_signs: Vec<HistoryRecord<String>>,
    squawks: Vec<HistoryRecord<String>>,
    transmission_types: Vec<HistoryRecord<u8>>,
    path_samples: Vec<PathSample>,
    flight_paths: BTreeMap<Uuid, FlightPathRecord>,
    next_sample_id: i64,
}

/// Point-in-time copy of everything in a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSnapshot {
    pub sessions: Vec<Session>,
    pub aircraft: Vec<AircraftRecord>,
    pub sightings: Vec<SightingRecord>,
    pub call_signs: Vec<HistoryRecord<String>>,
    pub squawks: Vec<HistoryRecord<String>>,
    pub transmission_types: Vec<HistoryRecord<u8>>,
    pub path_samples: Vec<PathSample>,
    pub flight_paths: Vec<FlightPathRecord>,
}

impl StoreSnapshot {
    pub fn sightings_for(&self, session_id: Uuid) -> Vec<&SightingRecord> {
        self.sightings
            .iter()
            .filter(|s| s.session_id == session_id)
            .collect()
    }

    pub fn samples_for(&self, sighting_id: Uuid) -> Vec<&PathSample> {
        self.path_samples
            .iter()
            .filter(|s| s.sighting_id == sighting_id)
            .collect()
    }
}

/// In-process [`SightingStore`]
///
/// Aircraft identities live in a `DashMap` so load-or-create is atomic per
/// ICAO without a global lock; everything else sits behind one mutex, which
/// also makes the batched close trivially all-or-nothing.
///
/// Individual operations can be made to fail with [`MemoryStore::fail_operation`]
/// to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    aircraft: DashMap<String, AircraftRecord>,
    tables: Mutex<Tables>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of the named trait method return an error until
    /// [`MemoryStore::clear_failures`] is called
    pub fn fail_operation(&self, operation: &'static str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation);
    }

    pub fn clear_failures(&self) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(operation)
        {
            bail!("{} failed (injected)", operation);
        }
        Ok(())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut aircraft: Vec<AircraftRecord> =
            self.aircraft.iter().map(|e| e.value().clone()).collect();
        aircraft.sort_by(|a, b| a.icao.cmp(&b.icao));

        StoreSnapshot {
            sessions: tables.sessions.values().cloned().collect(),
            aircraft,
            sightings: tables.sightings.values().cloned().collect(),
            call_signs: tables.call_signs.clone(),
            squawks: tables.squawks.clone(),
            transmission_types: tables.transmission_types.clone(),
            path_samples: tables.path_samples.clone(),
            flight_paths: tables.flight_paths.values().cloned().collect(),
        }
    }

    /// Write the current contents as pretty-printed JSON
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write store snapshot to {}", path.display()))?;
        info!(
            "Wrote store snapshot ({} sightings, {} path samples) to {}",
            snapshot.sightings.len(),
            snapshot.path_samples.len(),
            path.display()
        );
        Ok(())
    }
}

fn open_row(tables: &mut Tables, sighting_id: Uuid) -> Option<&mut SightingRecord> {
    tables
        .sightings
        .get_mut(&sighting_id)
        .filter(|s| s.closed_at.is_none())
}

#[async_trait]
impl SightingStore for MemoryStore {
    async fn open_session(&self, project: &str, now: DateTime<Utc>) -> Result<Session> {
        self.check("open_session")?;
        let session = Session {
            id: Uuid::now_v7(),
            project: project.to_string(),
            opened_at: now,
            closed_at: None,
        };
        self.tables()?.sessions.insert(session.id, session.clone());
        debug!("Opened session {} for project {}", session.id, project);
        Ok(session)
    }

    async fn close_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        self.check("close_session")?;
        let mut tables = self.tables()?;
        match tables
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.closed_at.is_none())
        {
            Some(session) => {
                session.closed_at = Some(now);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn load_or_create_aircraft(
        &self,
        icao: &str,
        now: DateTime<Utc>,
    ) -> Result<AircraftRecord> {
        self.check("load_or_create_aircraft")?;
        let record = self
            .aircraft
            .entry(icao.to_string())
            .or_insert_with(|| AircraftRecord {
                id: Uuid::now_v7(),
                icao: icao.to_string(),
                created_at: now,
            })
            .clone();
        Ok(record)
    }

    async fn latest_sighting(
        &self,
        session_id: Uuid,
        aircraft_id: Uuid,
    ) -> Result<Option<SightingRecord>> {
        self.check("latest_sighting")?;
        let tables = self.tables()?;
        Ok(tables
            .sightings
            .values()
            .filter(|s| s.session_id == session_id && s.aircraft_id == aircraft_id)
            .max_by_key(|s| (s.opened_at, s.id))
            .cloned())
    }

    async fn create_sighting(
        &self,
        session_id: Uuid,
        aircraft_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SightingRecord> {
        self.check("create_sighting")?;
        let record = SightingRecord {
            id: Uuid::now_v7(),
            session_id,
            aircraft_id,
            opened_at: now,
            closed_at: None,
            call_sign: None,
            squawk: None,
        };
        self.tables()?.sightings.insert(record.id, record.clone());
        Ok(record)
    }

    async fn reopen_sighting(&self, sighting_id: Uuid) -> Result<u64> {
        self.check("reopen_sighting")?;
        let mut tables = self.tables()?;
        match tables
            .sightings
            .get_mut(&sighting_id)
            .filter(|s| s.closed_at.is_some())
        {
            Some(row) => {
                row.closed_at = None;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn update_sighting_call_sign(&self, sighting_id: Uuid, call_sign: &str) -> Result<u64> {
        self.check("update_sighting_call_sign")?;
        let mut tables = self.tables()?;
        Ok(match open_row(&mut tables, sighting_id) {
            Some(row) => {
                row.call_sign = Some(call_sign.to_string());
                1
            }
            None => 0,
        })
    }

    async fn update_sighting_squawk(&self, sighting_id: Uuid, squawk: &str) -> Result<u64> {
        self.check("update_sighting_squawk")?;
        let mut tables = self.tables()?;
        Ok(match open_row(&mut tables, sighting_id) {
            Some(row) => {
                row.squawk = Some(squawk.to_string());
                1
            }
            None => 0,
        })
    }

    async fn insert_call_sign(
        &self,
        sighting_id: Uuid,
        call_sign: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("insert_call_sign")?;
        self.tables()?.call_signs.push(HistoryRecord {
            sighting_id,
            value: call_sign.to_string(),
            recorded_at: now,
        });
        Ok(1)
    }

    async fn insert_squawk(
        &self,
        sighting_id: Uuid,
        squawk: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("insert_squawk")?;
        self.tables()?.squawks.push(HistoryRecord {
            sighting_id,
            value: squawk.to_string(),
            recorded_at: now,
        });
        Ok(1)
    }

    async fn insert_transmission_type(
        &self,
        sighting_id: Uuid,
        transmission_type: u8,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("insert_transmission_type")?;
        self.tables()?.transmission_types.push(HistoryRecord {
            sighting_id,
            value: transmission_type,
            recorded_at: now,
        });
        Ok(1)
    }

    async fn insert_path_sample(&self, sample: NewPathSample) -> Result<u64> {
        self.check("insert_path_sample")?;
        let mut tables = self.tables()?;
        tables.next_sample_id += 1;
        let id = tables.next_sample_id;
        tables.path_samples.push(PathSample {
            id,
            sighting_id: sample.sighting_id,
            recorded_at: sample.recorded_at,
            altitude: sample.altitude,
            latitude: sample.latitude,
            longitude: sample.longitude,
            vertical_rate: sample.vertical_rate,
        });
        Ok(1)
    }

    async fn close_sightings(&self, sighting_ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        self.check("close_sightings")?;
        let mut tables = self.tables()?;

        // validate the whole batch before touching anything
        if let Some(missing) = sighting_ids
            .iter()
            .find(|id| !tables.sightings.contains_key(*id))
        {
            bail!("cannot close unknown sighting {}", missing);
        }

        let mut closed = 0;
        for id in sighting_ids {
            if let Some(row) = open_row(&mut tables, *id) {
                row.closed_at = Some(now);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn path_samples(
        &self,
        sighting_id: Uuid,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<PathSample>> {
        self.check("path_samples")?;
        let tables = self.tables()?;
        let after = after.unwrap_or(i64::MIN);
        Ok(tables
            .path_samples
            .iter()
            .filter(|s| s.sighting_id == sighting_id && s.id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn flight_path(&self, sighting_id: Uuid) -> Result<Option<FlightPathRecord>> {
        self.check("flight_path")?;
        Ok(self.tables()?.flight_paths.get(&sighting_id).cloned())
    }

    async fn create_flight_path(
        &self,
        sighting_id: Uuid,
        document: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("create_flight_path")?;
        let mut tables = self.tables()?;
        if tables.flight_paths.contains_key(&sighting_id) {
            bail!("flight path for sighting {} already exists", sighting_id);
        }
        tables.flight_paths.insert(
            sighting_id,
            FlightPathRecord {
                sighting_id,
                document: document.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(1)
    }

    async fn update_flight_path(
        &self,
        sighting_id: Uuid,
        document: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check("update_flight_path")?;
        let mut tables = self.tables()?;
        Ok(match tables.flight_paths.get_mut(&sighting_id) {
            Some(record) => {
                record.document = document.clone();
                record.updated_at = now;
                1
            }
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_load_or_create_aircraft_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.load_or_create_aircraft("424242", t0()).await.unwrap();
        let second = store.load_or_create_aircraft("424242", t0()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.snapshot().aircraft.len(), 1);
    }

    #[tokio::test]
    async fn test_close_sightings_is_all_or_nothing() {
        let store = MemoryStore::new();
        let session = store.open_session("test", t0()).await.unwrap();
        let aircraft = store.load_or_create_aircraft("424242", t0()).await.unwrap();
        let row = store
            .create_sighting(session.id, aircraft.id, t0())
            .await
            .unwrap();

        let result = store.close_sightings(&[row.id, Uuid::new_v4()], t0()).await;
        assert!(result.is_err());
        assert!(store.snapshot().sightings[0].closed_at.is_none());

        let closed = store.close_sightings(&[row.id], t0()).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(store.snapshot().sightings[0].closed_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_updates_skip_closed_rows() {
        let store = MemoryStore::new();
        let session = store.open_session("test", t0()).await.unwrap();
        let aircraft = store.load_or_create_aircraft("424242", t0()).await.unwrap();
        let row = store
            .create_sighting(session.id, aircraft.id, t0())
            .await
            .unwrap();

        assert_eq!(store.update_sighting_squawk(row.id, "7000").await.unwrap(), 1);
        store.close_sightings(&[row.id], t0()).await.unwrap();
        assert_eq!(store.update_sighting_squawk(row.id, "7700").await.unwrap(), 0);
        assert_eq!(store.reopen_sighting(row.id).await.unwrap(), 1);
        assert_eq!(store.update_sighting_squawk(row.id, "7700").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_path_samples_are_paged_by_id() {
        let store = MemoryStore::new();
        let sighting_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .insert_path_sample(NewPathSample {
                    sighting_id,
                    recorded_at: t0(),
                    altitude: 1000 + i,
                    latitude: 51.0,
                    longitude: 0.0,
                    vertical_rate: None,
                })
                .await
                .unwrap();
        }

        let first = store.path_samples(sighting_id, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let next = store
            .path_samples(sighting_id, first.last().map(|s| s.id), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 3);
        assert_eq!(next[0].altitude, 1002);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_operation("open_session");
        assert!(store.open_session("test", t0()).await.is_err());
        store.clear_failures();
        assert!(store.open_session("test", t0()).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = MemoryStore::new();
        store.open_session("test", t0()).await.unwrap();
        store.write_snapshot(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["sessions"][0]["project"], "test");
    }
}
