//! Lifecycle callbacks for map/UI subsystems.
//!
//! Aircraft callbacks are invoked while the sighting lock is held, so
//! implementations must be quick and must not call back into the tracker.

use tracing::{debug, info};

use crate::project::Project;
use crate::sighting::Sighting;

#[allow(unused_variables)]
pub trait TrackerListener: Send + Sync {
    fn project_activated(&self, project: &Project) {}

    fn project_deactivated(&self, project: &Project) {}

    /// The project observes this aircraft for the first time (new row)
    fn aircraft_first_seen(&self, project: &Project, sighting: &Sighting) {}

    /// A message changed the aircraft state as seen by this project
    fn aircraft_updated(&self, project: &Project, sighting: &Sighting) {}

    /// The project's observation was evicted
    fn aircraft_lost(&self, project: &Project, sighting: &Sighting) {}
}

#[derive(Debug, Default)]
pub struct LogListener;

impl TrackerListener for LogListener {
    fn project_activated(&self, project: &Project) {
        info!(project = %project.name(), session = %project.session_id(), "project activated");
    }

    fn project_deactivated(&self, project: &Project) {
        info!(
            project = %project.name(),
            seen = project.messages_seen(),
            filtered = project.messages_filtered(),
            "project deactivated"
        );
    }

    fn aircraft_first_seen(&self, project: &Project, sighting: &Sighting) {
        info!(
            project = %project.name(),
            icao = %sighting.icao,
            call_sign = ?sighting.state.call_sign,
            country = ?sighting.state.country,
            "aircraft first seen"
        );
    }

    fn aircraft_updated(&self, project: &Project, sighting: &Sighting) {
        debug!(
            project = %project.name(),
            icao = %sighting.icao,
            altitude = ?sighting.state.altitude,
            location = ?sighting.state.location,
            "aircraft updated"
        );
    }

    fn aircraft_lost(&self, project: &Project, sighting: &Sighting) {
        info!(project = %project.name(), icao = %sighting.icao, "aircraft lost");
    }
}
