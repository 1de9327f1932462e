//! In-memory aircraft state shared by all projects, and each project's
//! observation of it.
//!
//! A [`Sighting`] is only ever touched through the registry's per-sighting
//! lock, so nothing in here does its own synchronisation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::error::Result;
use crate::message::Message;
use crate::store::{AircraftRecord, SightingRecord};

/// A takeoff is complete once the aircraft levels off this far above the
/// altitude it was at when the takeoff was confirmed. Descending does not
/// count as levelling off.
pub const TAKEOFF_CLEAR_MARGIN_FT: i32 = 200;

/// Scalar values carried by one message, parsed up front so a malformed
/// field rejects the whole message before anything is merged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub altitude: Option<i32>,
    pub location: Option<(f64, f64)>,
    pub call_sign: Option<String>,
    pub squawk: Option<String>,
    pub vertical_rate: Option<i32>,
    pub track: Option<f32>,
    pub ground_speed: Option<f32>,
    pub on_ground: bool,
}

impl StateUpdate {
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            altitude: message.altitude()?,
            location: message.location()?,
            call_sign: message.call_sign().map(str::to_string),
            squawk: message.squawk().map(str::to_string),
            vertical_rate: message.vertical_rate()?,
            track: message.track()?,
            ground_speed: message.ground_speed()?,
            on_ground: message.is_on_ground,
        })
    }
}

/// Which fields actually changed while merging one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateChanges {
    pub altitude: bool,
    pub location: bool,
    pub call_sign: bool,
    pub squawk: bool,
    pub vertical_rate: bool,
    pub on_ground: bool,
    pub takeoff_started: bool,
    pub takeoff_completed: bool,
}

impl StateChanges {
    pub fn any(&self) -> bool {
        self.altitude
            || self.location
            || self.call_sign
            || self.squawk
            || self.vertical_rate
            || self.on_ground
            || self.takeoff_started
            || self.takeoff_completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TakeoffTag {
    pub started_at: DateTime<Utc>,
    pub start_altitude: Option<i32>,
}

/// Latest merged state of one aircraft
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SightingState {
    pub altitude: Option<i32>,
    pub location: Option<(f64, f64)>,
    pub call_sign: Option<String>,
    pub squawk: Option<String>,
    /// Confirmed on-ground flag, seeded by the first message
    pub on_ground: Option<bool>,
    /// Unconfirmed value waiting for enough consecutive reports
    pub on_ground_candidate: Option<bool>,
    pub on_ground_count: u32,
    pub country: Option<String>,
    pub vertical_rate: Option<i32>,
    pub track: Option<f32>,
    pub ground_speed: Option<f32>,
    pub takeoff: Option<TakeoffTag>,
}

fn merge<T: PartialEq + Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) if slot.as_ref() != Some(value) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

impl SightingState {
    /// Merge present fields, run on-ground hysteresis and takeoff tagging.
    ///
    /// `confirmations` is the number of consecutive matching reports a new
    /// on-ground value must exceed before it is committed.
    pub fn apply(
        &mut self,
        update: &StateUpdate,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> StateChanges {
        let mut changes = StateChanges {
            altitude: merge(&mut self.altitude, &update.altitude),
            location: merge(&mut self.location, &update.location),
            call_sign: merge(&mut self.call_sign, &update.call_sign),
            squawk: merge(&mut self.squawk, &update.squawk),
            vertical_rate: merge(&mut self.vertical_rate, &update.vertical_rate),
            ..Default::default()
        };
        merge(&mut self.track, &update.track);
        merge(&mut self.ground_speed, &update.ground_speed);

        let previous = self.on_ground;
        changes.on_ground = self.confirm_on_ground(update.on_ground, confirmations);

        if changes.on_ground {
            match (previous, self.on_ground) {
                (Some(true), Some(false)) if self.vertical_rate.is_some_and(|vr| vr > 0) => {
                    self.takeoff = Some(TakeoffTag {
                        started_at: now,
                        start_altitude: self.altitude,
                    });
                    changes.takeoff_started = true;
                }
                // back on the ground before the climb-out finished
                (_, Some(true)) => self.takeoff = None,
                _ => {}
            }
        } else if let Some(tag) = self.takeoff
            && self.vertical_rate == Some(0)
            && self.altitude.is_some_and(|alt| {
                alt > tag.start_altitude.unwrap_or(0) + TAKEOFF_CLEAR_MARGIN_FT
            })
        {
            self.takeoff = None;
            changes.takeoff_completed = true;
        }

        changes
    }

    /// Returns true when the confirmed value changed
    fn confirm_on_ground(&mut self, observed: bool, confirmations: u32) -> bool {
        match self.on_ground {
            None => {
                self.on_ground = Some(observed);
                true
            }
            Some(confirmed) if confirmed == observed => {
                self.on_ground_candidate = None;
                self.on_ground_count = 0;
                false
            }
            Some(_) => {
                if self.on_ground_candidate == Some(observed) {
                    self.on_ground_count += 1;
                } else {
                    self.on_ground_candidate = Some(observed);
                    self.on_ground_count = 1;
                }

                if self.on_ground_count > confirmations {
                    self.on_ground = Some(observed);
                    self.on_ground_candidate = None;
                    self.on_ground_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn in_takeoff(&self) -> bool {
        self.takeoff.is_some()
    }

    pub fn is_airborne(&self) -> bool {
        self.on_ground == Some(false)
    }
}

/// Result of reverse geocoding an endpoint of an observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeLocation {
    pub found: bool,
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeocodeLocation {
    pub fn not_found(latitude: f64, longitude: f64) -> Self {
        Self {
            found: false,
            label: String::new(),
            latitude,
            longitude,
        }
    }

    pub fn label_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.found && !self.label.is_empty() {
            &self.label
        } else {
            fallback
        }
    }
}

/// Cached fields that differ from what this observation last persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservationUpdates {
    pub altitude: bool,
    pub location: bool,
    pub call_sign: bool,
    pub squawk: bool,
}

impl ObservationUpdates {
    pub fn any(&self) -> bool {
        self.altitude || self.location || self.call_sign || self.squawk
    }
}

/// One project's view of a sighting: the persisted row backing it and the
/// change-detection cache used to only write on real changes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectObservation {
    /// Currently open persisted sighting row
    pub sighting_id: Uuid,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub altitude: Option<i32>,
    pub location: Option<(f64, f64)>,
    pub call_sign: Option<String>,
    pub squawk: Option<String>,
    pub origin: Option<GeocodeLocation>,
    pub destination: Option<GeocodeLocation>,
    pub in_takeoff: bool,
    pub transmission_types: BTreeSet<u8>,
}

impl ProjectObservation {
    pub fn new(sighting_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            sighting_id,
            first_seen: now,
            last_seen: now,
            altitude: None,
            location: None,
            call_sign: None,
            squawk: None,
            origin: None,
            destination: None,
            in_takeoff: false,
            transmission_types: BTreeSet::new(),
        }
    }

    /// Continue an existing row: caches start from what the row already holds
    pub fn continuing(row: &SightingRecord, now: DateTime<Utc>) -> Self {
        Self {
            first_seen: row.opened_at,
            call_sign: row.call_sign.clone(),
            squawk: row.squawk.clone(),
            ..Self::new(row.id, now)
        }
    }

    pub fn pending_updates(&self, state: &SightingState) -> ObservationUpdates {
        fn differs<T: PartialEq>(cached: &Option<T>, current: &Option<T>) -> bool {
            current.is_some() && cached != current
        }

        ObservationUpdates {
            altitude: differs(&self.altitude, &state.altitude),
            location: differs(&self.location, &state.location),
            call_sign: differs(&self.call_sign, &state.call_sign),
            squawk: differs(&self.squawk, &state.squawk),
        }
    }

    pub fn is_lost(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_seen > timeout
    }
}

/// Everything known about one aircraft, shared across projects
#[derive(Debug, Clone)]
pub struct Sighting {
    pub icao: String,
    pub state: SightingState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub aircraft: Option<AircraftRecord>,
    pub country_resolved: bool,
    /// Keyed by project session id
    pub observations: HashMap<Uuid, ProjectObservation>,
    removed: bool,
}

impl Sighting {
    pub fn new(icao: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            icao: icao.into(),
            state: SightingState::default(),
            first_seen: now,
            last_seen: now,
            aircraft: None,
            country_resolved: false,
            observations: HashMap::new(),
            removed: false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Aircraft-wide loss: nobody has reported this aircraft within the timeout
    pub fn is_lost(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_seen > timeout
    }

    /// True once the registry has dropped this sighting; holders of a stale
    /// handle must look the aircraft up again
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub(crate) fn mark_removed(&mut self) {
        self.removed = true;
    }
}
