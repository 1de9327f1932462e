use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Tracker;
use crate::email::{EmailAttachment, EmailJob};
use crate::error::{Result, TrackerError};
use crate::project::{Feature, Notification, Project};
use crate::route::{RouteBuilder, RouteDocument, UNKNOWN_LOCATION, format_distance};
use crate::sighting::{GeocodeLocation, ProjectObservation, Sighting};

/// "BAW123 (4CA1FA)" or just the address without a call sign
fn aircraft_label(sighting: &Sighting) -> String {
    match sighting.state.call_sign.as_deref() {
        Some(call_sign) => format!("{} ({})", call_sign, sighting.icao),
        None => sighting.icao.clone(),
    }
}

fn optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl Tracker {
    /// Reverse geocode one endpoint. Failures and high altitudes yield a
    /// not-found location so each endpoint is only attempted once.
    pub(super) async fn geocode_endpoint(
        &self,
        icao: &str,
        latitude: f64,
        longitude: f64,
        altitude: Option<i32>,
    ) -> GeocodeLocation {
        if let Some(altitude) = altitude
            && altitude > self.config.geocode_max_altitude_ft
        {
            debug!(icao = %icao, altitude, "too high to geocode endpoint");
            return GeocodeLocation::not_found(latitude, longitude);
        }

        match self
            .services
            .geocoder
            .reverse_geocode(latitude, longitude)
            .await
        {
            Ok(result) if result.is_match() => {
                metrics::counter!("tracker.geocode.found_total").increment(1);
                GeocodeLocation {
                    found: true,
                    label: result.label,
                    latitude,
                    longitude,
                }
            }
            Ok(_) => {
                metrics::counter!("tracker.geocode.not_found_total").increment(1);
                GeocodeLocation::not_found(latitude, longitude)
            }
            Err(e) => {
                warn!(icao = %icao, latitude, longitude, "Reverse geocode failed: {:#}", e);
                metrics::counter!("tracker.geocode.failed_total").increment(1);
                GeocodeLocation::not_found(latitude, longitude)
            }
        }
    }

    pub(super) fn sighting_email(
        &self,
        project: &Project,
        sighting: &Sighting,
        kind: Notification,
    ) -> EmailJob {
        let aircraft = aircraft_label(sighting);
        let state = &sighting.state;

        let headline = match kind {
            Notification::SpottedInFlight => format!("Spotted {}", aircraft),
            Notification::TakeoffStart => format!("{} is taking off", aircraft),
            Notification::TakeoffComplete => format!("{} has completed its takeoff", aircraft),
            Notification::MapProduced => format!("Flight path of {}", aircraft),
        };

        let location = state
            .location
            .map(|(lat, lon)| format!("{:.4}, {:.4}", lat, lon));
        let body = format!(
            "{headline}\n\n\
             Project: {project}\n\
             ICAO: {icao}\n\
             Country: {country}\n\
             Squawk: {squawk}\n\
             Altitude: {altitude} ft\n\
             Vertical rate: {vertical_rate} ft/min\n\
             Position: {location}\n",
            headline = headline,
            project = project.name(),
            icao = sighting.icao,
            country = optional(state.country.as_deref()),
            squawk = optional(state.squawk.as_deref()),
            altitude = optional(state.altitude),
            vertical_rate = optional(state.vertical_rate),
            location = optional(location),
        );

        EmailJob {
            to: project.recipients().to_vec(),
            subject: format!("[{}] {}", project.name(), headline),
            body,
            attachment: None,
        }
    }

    /// Finalise one lost observation: destination geocode and flight-path
    /// document. Called during eviction with the sighting still locked.
    pub(super) async fn notify_lost(
        &self,
        project: &Project,
        sighting: &mut Sighting,
        session_id: Uuid,
    ) -> Result<()> {
        let icao = sighting.icao.as_str();
        let call_sign = sighting.state.call_sign.as_deref();
        let observation = sighting.observations.get_mut(&session_id).ok_or_else(|| {
            TrackerError::Invariant(format!(
                "lost observation of project '{}' missing from sighting {}",
                project.name(),
                icao
            ))
        })?;

        if project.has_feature(Feature::GeocodeEndpoints)
            && observation.destination.is_none()
            && let Some((latitude, longitude)) = observation.location
        {
            observation.destination = Some(
                self.geocode_endpoint(icao, latitude, longitude, observation.altitude)
                    .await,
            );
        }

        if project.has_feature(Feature::TrackFlightPath) {
            self.write_flight_path(project, icao, call_sign, observation)
                .await?;
        }

        Ok(())
    }

    async fn write_flight_path(
        &self,
        project: &Project,
        icao: &str,
        call_sign: Option<&str>,
        observation: &ProjectObservation,
    ) -> Result<()> {
        let store = &self.services.store;
        let row = observation.sighting_id;

        let mut builder = RouteBuilder::new();
        let mut cursor = None;
        loop {
            let batch = store
                .path_samples(row, cursor, self.config.path_batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);
            for sample in &batch {
                builder.push(sample);
            }
            if batch.len() < self.config.path_batch_size {
                break;
            }
        }

        let origin = observation
            .origin
            .as_ref()
            .map_or(UNKNOWN_LOCATION, |o| o.label_or(UNKNOWN_LOCATION));
        let destination = observation
            .destination
            .as_ref()
            .map_or(UNKNOWN_LOCATION, |d| d.label_or(UNKNOWN_LOCATION));

        let samples = builder.len();
        let Some(document) = builder.finish(icao, call_sign, origin, destination) else {
            debug!(project = %project.name(), icao = %icao, samples, "not enough samples for a flight path");
            return Ok(());
        };

        let now = self.services.clock.now();
        let affected = if store.flight_path(row).await?.is_some() {
            store
                .update_flight_path(row, &document.geojson, now)
                .await?
        } else {
            store
                .create_flight_path(row, &document.geojson, now)
                .await?
        };
        if affected == 0 {
            warn!(project = %project.name(), icao = %icao, row = %row, "flight path write affected no rows");
        }

        info!(
            project = %project.name(),
            icao = %icao,
            samples,
            distance_m = document.summary.distance_m,
            duration = %document.summary.duration,
            "flight path stored"
        );

        if project.notifies(Notification::MapProduced) {
            self.services
                .notifier
                .queue(map_email(project, row, &document));
        }

        Ok(())
    }
}

fn map_email(project: &Project, row: Uuid, document: &RouteDocument) -> EmailJob {
    let summary = &document.summary;
    let aircraft = match summary.call_sign.as_deref() {
        Some(call_sign) => format!("{} ({})", call_sign, summary.icao),
        None => summary.icao.clone(),
    };

    let body = format!(
        "Flight path of {aircraft}\n\n\
         Project: {project}\n\
         From: {origin}\n\
         To: {destination}\n\
         Started: {started}\n\
         Ended: {ended}\n\
         Duration: {duration}\n\
         Distance: {distance}\n\
         Samples: {samples}\n",
        aircraft = aircraft,
        project = project.name(),
        origin = summary.origin,
        destination = summary.destination,
        started = summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        ended = summary.ended_at.format("%Y-%m-%d %H:%M:%S UTC"),
        duration = summary.duration,
        distance = format_distance(summary.distance_m),
        samples = summary.samples,
    );

    EmailJob {
        to: project.recipients().to_vec(),
        subject: format!(
            "[{}] Flight path of {}: {} to {}",
            project.name(),
            aircraft,
            summary.origin,
            summary.destination
        ),
        body,
        attachment: Some(EmailAttachment {
            filename: format!("{}-{}.geojson", summary.icao, row),
            content_type: "application/geo+json".to_string(),
            body: document.geojson.to_string(),
        }),
    }
}
