use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::Tracker;
use crate::error::{Result, TrackerError};
use crate::message::Message;
use crate::project::{Feature, Notification, Project};
use crate::sighting::{ProjectObservation, Sighting, StateChanges, StateUpdate};
use crate::store::NewPathSample;

/// Remember the first failure of a message while letting the other side
/// effects go ahead
fn note_failure(
    failure: &mut Option<TrackerError>,
    project: &Project,
    icao: &str,
    what: &str,
    error: TrackerError,
) {
    warn!(project = %project.name(), icao = %icao, "Failed to {}: {}", what, error);
    metrics::counter!("tracker.persistence.failed_total", "write" => what.to_string())
        .increment(1);
    failure.get_or_insert(error);
}

impl Tracker {
    /// Apply one message to every project in declaration order.
    ///
    /// Per-project failures are logged and do not stop the other projects.
    /// Returns an error when the message itself is malformed or an invariant
    /// was violated, in which case the remaining projects are skipped.
    pub async fn handle_message(&self, message: &Message) -> Result<()> {
        self.apply(message, &self.projects, false).await
    }

    /// Apply one message to a single project, surfacing its error
    pub async fn process_message(&self, project: &Project, message: &Message) -> Result<()> {
        self.apply(message, std::slice::from_ref(project), true).await
    }

    async fn apply(&self, message: &Message, projects: &[Project], surface: bool) -> Result<()> {
        let icao = message.icao_key();
        if icao.is_empty() {
            return Err(TrackerError::InvalidField {
                field: "icao",
                value: message.icao.clone(),
            });
        }

        let now = self.services.clock.now();
        let mut guard = self.registry.get_or_create(&icao, now).await;
        let sighting: &mut Sighting = &mut guard;
        sighting.touch(now);

        let update = StateUpdate::from_message(message)?;
        let changes = sighting
            .state
            .apply(&update, self.config.on_ground_confirmations, now);
        if changes.on_ground {
            trace!(icao = %icao, on_ground = ?sighting.state.on_ground, "on-ground state confirmed");
        }

        self.resolve_country(sighting).await;

        for project in projects {
            match self.observe(sighting, project, message, changes, now).await {
                Ok(()) => {}
                Err(e) if e.is_invariant() => {
                    error!(project = %project.name(), icao = %icao, "{}", e);
                    metrics::counter!("tracker.messages.errors_total", "kind" => e.kind())
                        .increment(1);
                    return Err(e);
                }
                Err(e) if surface => return Err(e),
                Err(e) => {
                    if matches!(e, TrackerError::Persistence(_)) {
                        debug!(project = %project.name(), icao = %icao, "Message not fully applied: {}", e);
                    } else {
                        warn!(project = %project.name(), icao = %icao, "Message rejected: {}", e);
                    }
                    metrics::counter!("tracker.messages.errors_total", "kind" => e.kind())
                        .increment(1);
                }
            }
        }

        Ok(())
    }

    /// At most once per sighting; no match just leaves the country unset
    async fn resolve_country(&self, sighting: &mut Sighting) {
        if sighting.country_resolved {
            return;
        }
        sighting.country_resolved = true;

        match self.services.countries.determine_country(&sighting.icao).await {
            Ok(country) => sighting.state.country = country,
            Err(e) => debug!(icao = %sighting.icao, "Country lookup failed: {:#}", e),
        }
    }

    async fn resolve_aircraft(&self, sighting: &mut Sighting, now: DateTime<Utc>) -> Result<Uuid> {
        if let Some(aircraft) = &sighting.aircraft {
            return Ok(aircraft.id);
        }
        let record = self
            .services
            .store
            .load_or_create_aircraft(&sighting.icao, now)
            .await?;
        let id = record.id;
        sighting.aircraft = Some(record);
        Ok(id)
    }

    /// Continue the latest row when it is still open or was closed recently
    /// enough to reopen; otherwise create a new one. The flag is true only
    /// for a new row.
    async fn open_observation(
        &self,
        project: &Project,
        icao: &str,
        aircraft_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(ProjectObservation, bool)> {
        let store = &self.services.store;
        let session_id = project.session_id();

        if let Some(row) = store.latest_sighting(session_id, aircraft_id).await? {
            match row.closed_at {
                None => {
                    debug!(project = %project.name(), icao = %icao, row = %row.id, "continuing open sighting row");
                    return Ok((ProjectObservation::continuing(&row, now), false));
                }
                Some(closed_at) if project.reopen().allows(now - closed_at) => {
                    if store.reopen_sighting(row.id).await? > 0 {
                        info!(
                            project = %project.name(),
                            icao = %icao,
                            row = %row.id,
                            gap_secs = (now - closed_at).num_seconds(),
                            "reopened sighting"
                        );
                        metrics::counter!("tracker.sightings.reopened_total").increment(1);
                        return Ok((ProjectObservation::continuing(&row, now), false));
                    }
                    warn!(project = %project.name(), icao = %icao, row = %row.id, "sighting row could not be reopened, starting a new one");
                }
                Some(_) => {}
            }
        }

        let row = store.create_sighting(session_id, aircraft_id, now).await?;
        metrics::counter!("tracker.sightings.created_total").increment(1);
        Ok((ProjectObservation::new(row.id, now), true))
    }

    async fn record_call_sign(&self, row: Uuid, call_sign: &str, now: DateTime<Utc>) -> Result<()> {
        let store = &self.services.store;
        store.insert_call_sign(row, call_sign, now).await?;
        store.update_sighting_call_sign(row, call_sign).await?;
        Ok(())
    }

    /// Returns false when the row was no longer open
    async fn record_squawk(&self, row: Uuid, squawk: &str, now: DateTime<Utc>) -> Result<bool> {
        let store = &self.services.store;
        if store.update_sighting_squawk(row, squawk).await? == 0 {
            return Ok(false);
        }
        store.insert_squawk(row, squawk, now).await?;
        Ok(true)
    }

    /// Steps from filter evaluation onwards, for one project
    async fn observe(
        &self,
        sighting: &mut Sighting,
        project: &Project,
        message: &Message,
        changes: StateChanges,
        now: DateTime<Utc>,
    ) -> Result<()> {
        project.record_seen();

        if let Some(filter) = project.filter() {
            let matched = filter
                .evaluate(message, &sighting.state)
                .map_err(|e| TrackerError::Filter(format!("{:#}", e)))?;
            if !matched {
                project.record_filtered();
                trace!(project = %project.name(), icao = %sighting.icao, "message filtered out");
                return Ok(());
            }
        }

        let aircraft_id = self.resolve_aircraft(sighting, now).await?;

        let session_id = project.session_id();
        let first_sighting = if sighting.observations.contains_key(&session_id) {
            false
        } else {
            let (observation, is_new) = self
                .open_observation(project, &sighting.icao, aircraft_id, now)
                .await?;
            sighting.observations.insert(session_id, observation);
            is_new
        };

        let icao = sighting.icao.as_str();
        let state = &sighting.state;
        let observation = sighting.observations.get_mut(&session_id).ok_or_else(|| {
            TrackerError::Invariant(format!(
                "observation of project '{}' missing from sighting {}",
                project.name(),
                icao
            ))
        })?;

        observation.last_seen = now;
        let updates = observation.pending_updates(state);
        let row = observation.sighting_id;
        let mut failure = None;

        if updates.call_sign
            && let Some(call_sign) = state.call_sign.as_deref()
        {
            let written = if project.has_feature(Feature::TrackCallsigns) {
                self.record_call_sign(row, call_sign, now).await
            } else {
                Ok(())
            };
            match written {
                Ok(()) => observation.call_sign = Some(call_sign.to_string()),
                Err(e) => note_failure(&mut failure, project, icao, "record call sign", e),
            }
        }

        if updates.squawk
            && let Some(squawk) = state.squawk.as_deref()
        {
            let written = if project.has_feature(Feature::TrackSquawks) {
                self.record_squawk(row, squawk, now).await
            } else {
                Ok(true)
            };
            match written {
                Ok(true) => observation.squawk = Some(squawk.to_string()),
                Ok(false) => {
                    debug!(project = %project.name(), icao = %icao, row = %row, "squawk not recorded, sighting row is closed")
                }
                Err(e) => note_failure(&mut failure, project, icao, "record squawk", e),
            }
        }

        if updates.altitude || updates.location {
            let sample = match (state.altitude, state.location) {
                (Some(altitude), Some((latitude, longitude)))
                    if project.has_feature(Feature::TrackFlightPath) =>
                {
                    Some(NewPathSample {
                        sighting_id: row,
                        recorded_at: now,
                        altitude,
                        latitude,
                        longitude,
                        vertical_rate: state.vertical_rate,
                    })
                }
                _ => None,
            };

            let written = match sample {
                Some(sample) => self
                    .services
                    .store
                    .insert_path_sample(sample)
                    .await
                    .map(|_| ())
                    .map_err(TrackerError::from),
                None => Ok(()),
            };
            match written {
                Ok(()) => {
                    if updates.altitude {
                        observation.altitude = state.altitude;
                    }
                    if updates.location {
                        observation.location = state.location;
                    }
                }
                Err(e) => note_failure(&mut failure, project, icao, "record path sample", e),
            }
        }

        if project.has_feature(Feature::TrackTransmissionTypes)
            && let Some(transmission_type) = message.transmission_type
            && !observation.transmission_types.contains(&transmission_type)
        {
            match self
                .services
                .store
                .insert_transmission_type(row, transmission_type, now)
                .await
            {
                Ok(_) => {
                    observation.transmission_types.insert(transmission_type);
                }
                Err(e) => note_failure(
                    &mut failure,
                    project,
                    icao,
                    "record transmission type",
                    e.into(),
                ),
            }
        }

        let mut takeoff_event = None;
        if project.has_feature(Feature::TrackTakeoff) && state.in_takeoff() != observation.in_takeoff
        {
            if state.in_takeoff() {
                takeoff_event = Some(Notification::TakeoffStart);
            } else if state.is_airborne() {
                takeoff_event = Some(Notification::TakeoffComplete);
            }
        }
        observation.in_takeoff = state.in_takeoff();

        if project.has_feature(Feature::GeocodeEndpoints)
            && observation.origin.is_none()
            && let Some((latitude, longitude)) = state.location
        {
            observation.origin = Some(
                self.geocode_endpoint(icao, latitude, longitude, state.altitude)
                    .await,
            );
        }

        let updated = changes.any() || updates.any();
        let sighting: &Sighting = sighting;

        if first_sighting {
            if project.notifies(Notification::SpottedInFlight) {
                self.services.notifier.queue(self.sighting_email(
                    project,
                    sighting,
                    Notification::SpottedInFlight,
                ));
            }
            for listener in &self.services.listeners {
                listener.aircraft_first_seen(project, sighting);
            }
        } else if updated {
            for listener in &self.services.listeners {
                listener.aircraft_updated(project, sighting);
            }
        }

        if let Some(event) = takeoff_event {
            debug!(project = %project.name(), icao = %sighting.icao, event = %event, "takeoff event");
            if project.notifies(event) {
                self.services
                    .notifier
                    .queue(self.sighting_email(project, sighting, event));
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
