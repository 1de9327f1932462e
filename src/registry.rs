//! Concurrent map of tracked aircraft.
//!
//! Two lock levels: a structural mutex around the map itself, held only while
//! membership changes or is scanned, and one mutex per [`Sighting`] guarding
//! its fields and observation map. Callers receive owned guards and release
//! them by dropping.
//!
//! Workers never wait on the structural lock while holding a sighting lock.
//! The sweep only *tries* sighting locks while it holds the structural lock,
//! so the two paths cannot deadlock. A sighting that is locked at every
//! sweep has its stale observations deferred until a sweep finds it idle.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::sighting::Sighting;

pub type SightingGuard = OwnedMutexGuard<Sighting>;

/// What the sweep's scan decided for one sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    /// Drop it from the registry now
    Remove,
    /// Nothing to do, unlock it
    Release,
    /// Keep it locked and hand it back to the caller
    Hold,
}

#[derive(Default)]
pub struct ScanOutcome {
    pub held: Vec<SightingGuard>,
    pub removed: usize,
    /// Sightings whose lock was taken by a worker at scan time
    pub busy: usize,
}

#[derive(Default)]
pub struct SightingRegistry {
    sightings: Mutex<HashMap<String, Arc<Mutex<Sighting>>>>,
}

impl SightingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the sighting for `icao`, creating it if unknown.
    ///
    /// A new sighting is locked before it becomes visible to anyone else, so
    /// two workers can never both initialise the same aircraft.
    pub async fn get_or_create(&self, icao: &str, now: DateTime<Utc>) -> SightingGuard {
        loop {
            let mut sightings = self.sightings.lock().await;

            if let Some(existing) = sightings.get(icao).cloned() {
                drop(sightings);
                let guard = existing.lock_owned().await;
                if guard.is_removed() {
                    // evicted while we were waiting, look it up again
                    trace!(icao = %icao, "sighting removed while waiting for lock");
                    continue;
                }
                return guard;
            }

            let sighting = Arc::new(Mutex::new(Sighting::new(icao, now)));
            let guard = sighting.clone().lock_owned().await;
            sightings.insert(icao.to_string(), sighting);
            metrics::gauge!("tracker.registry.sightings").set(sightings.len() as f64);
            debug!(icao = %icao, "tracking new aircraft");
            return guard;
        }
    }

    /// Lock an existing sighting without creating one
    pub async fn lock(&self, icao: &str) -> Option<SightingGuard> {
        let existing = self.sightings.lock().await.get(icao).cloned()?;
        let guard = existing.lock_owned().await;
        (!guard.is_removed()).then_some(guard)
    }

    /// Remove the sighting when no project observes it any more and nobody
    /// has reported it within `timeout`.
    ///
    /// Must not be called while holding that sighting's lock. Returns whether
    /// it was removed.
    pub async fn remove_if_empty(
        &self,
        icao: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> bool {
        self.remove_where(icao, |s| s.is_lost(now, timeout)).await
    }

    /// Remove the sighting as soon as no project observes it, however
    /// recently it was seen. Used on shutdown.
    pub async fn remove_empty(&self, icao: &str) -> bool {
        self.remove_where(icao, |_| true).await
    }

    async fn remove_where(&self, icao: &str, stale: impl FnOnce(&Sighting) -> bool) -> bool {
        let mut sightings = self.sightings.lock().await;
        let Some(existing) = sightings.get(icao).cloned() else {
            return false;
        };
        // A worker holding it is about to refresh it
        let Ok(mut guard) = existing.try_lock_owned() else {
            return false;
        };

        if guard.observations.is_empty() && stale(&guard) {
            guard.mark_removed();
            sightings.remove(icao);
            metrics::gauge!("tracker.registry.sightings").set(sightings.len() as f64);
            debug!(icao = %icao, "removed aircraft from registry");
            true
        } else {
            false
        }
    }

    /// Visit every sighting under the structural lock.
    ///
    /// Sightings whose lock is busy are skipped: a worker is applying a
    /// message to them, so they are not lost. They are revisited on the
    /// next scan.
    pub async fn scan(&self, mut decide: impl FnMut(&Sighting) -> ScanAction) -> ScanOutcome {
        let mut sightings = self.sightings.lock().await;
        let mut outcome = ScanOutcome::default();
        let mut to_remove = Vec::new();

        for (icao, entry) in sightings.iter() {
            let Ok(mut guard) = entry.clone().try_lock_owned() else {
                outcome.busy += 1;
                continue;
            };

            match decide(&guard) {
                ScanAction::Remove => {
                    guard.mark_removed();
                    to_remove.push(icao.clone());
                }
                ScanAction::Release => {}
                ScanAction::Hold => outcome.held.push(guard),
            }
        }

        for icao in &to_remove {
            sightings.remove(icao);
        }
        outcome.removed = to_remove.len();
        metrics::gauge!("tracker.registry.sightings").set(sightings.len() as f64);

        outcome
    }

    /// Lock every remaining sighting, waiting for each lock.
    ///
    /// Only meant for shutdown, once no worker is running.
    pub async fn drain_all(&self) -> Vec<SightingGuard> {
        let entries: Vec<_> = self.sightings.lock().await.values().cloned().collect();

        let mut guards = Vec::with_capacity(entries.len());
        for entry in entries {
            let guard = entry.lock_owned().await;
            if !guard.is_removed() {
                guards.push(guard);
            }
        }
        guards
    }

    pub async fn len(&self) -> usize {
        self.sightings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn icaos(&self) -> Vec<String> {
        let mut icaos: Vec<String> = self.sightings.lock().await.keys().cloned().collect();
        icaos.sort();
        icaos
    }
}
