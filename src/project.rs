//! Named monitoring policies.
//!
//! A [`Project`] is built once from configuration before the tracker starts
//! and never changes afterwards, apart from its message counters. The
//! per-aircraft observations of a project live inside each
//! [`Sighting`](crate::sighting::Sighting), not here.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::filter::Predicate;
use crate::store::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    TrackCallsigns,
    TrackSquawks,
    TrackTransmissionTypes,
    TrackFlightPath,
    TrackTakeoff,
    GeocodeEndpoints,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::TrackCallsigns => write!(f, "track-callsigns"),
            Feature::TrackSquawks => write!(f, "track-squawks"),
            Feature::TrackTransmissionTypes => write!(f, "track-transmission-types"),
            Feature::TrackFlightPath => write!(f, "track-flight-path"),
            Feature::TrackTakeoff => write!(f, "track-takeoff"),
            Feature::GeocodeEndpoints => write!(f, "geocode-endpoints"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Notification {
    SpottedInFlight,
    TakeoffStart,
    TakeoffComplete,
    MapProduced,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::SpottedInFlight => write!(f, "spotted-in-flight"),
            Notification::TakeoffStart => write!(f, "takeoff-start"),
            Notification::TakeoffComplete => write!(f, "takeoff-complete"),
            Notification::MapProduced => write!(f, "map-produced"),
        }
    }
}

/// Whether a recently closed sighting row may be continued instead of
/// starting a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReopenPolicy {
    pub enabled: bool,
    pub interval: Duration,
}

impl ReopenPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            interval: Duration::zero(),
        }
    }

    pub fn within(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
        }
    }

    /// A row closed `gap` ago can be reopened when the gap is strictly
    /// shorter than the interval
    pub fn allows(&self, gap: Duration) -> bool {
        self.enabled && gap < self.interval
    }
}

impl Default for ReopenPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Everything about a project that is known before its session is opened
#[derive(Debug, Clone)]
pub struct ProjectDefinition {
    pub name: String,
    pub filter: Option<Arc<dyn Predicate>>,
    pub features: HashSet<Feature>,
    pub notifications: HashSet<Notification>,
    pub recipients: Vec<String>,
    pub reopen: ReopenPolicy,
}

impl ProjectDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            features: HashSet::new(),
            notifications: HashSet::new(),
            recipients: Vec::new(),
            reopen: ReopenPolicy::disabled(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn Predicate>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn with_notification(mut self, notification: Notification) -> Self {
        self.notifications.insert(notification);
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn with_reopen(mut self, reopen: ReopenPolicy) -> Self {
        self.reopen = reopen;
        self
    }
}

pub struct Project {
    definition: ProjectDefinition,
    session: Session,
    messages_seen: AtomicU64,
    messages_filtered: AtomicU64,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.definition.name)
            .field("session", &self.session.id)
            .field("messages_seen", &self.messages_seen())
            .field("messages_filtered", &self.messages_filtered())
            .finish()
    }
}

impl Project {
    pub fn new(definition: ProjectDefinition, session: Session) -> Self {
        Self {
            definition,
            session,
            messages_seen: AtomicU64::new(0),
            messages_filtered: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Key of this project's observations inside a sighting
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    pub fn filter(&self) -> Option<&dyn Predicate> {
        self.definition.filter.as_deref()
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.definition.features.contains(&feature)
    }

    /// Subscribed and someone to tell
    pub fn notifies(&self, notification: Notification) -> bool {
        self.definition.notifications.contains(&notification)
            && !self.definition.recipients.is_empty()
    }

    pub fn recipients(&self) -> &[String] {
        &self.definition.recipients
    }

    pub fn reopen(&self) -> ReopenPolicy {
        self.definition.reopen
    }

    pub fn record_seen(&self) {
        self.messages_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.messages_filtered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tracker.messages.filtered_total", "project" => self.name().to_string())
            .increment(1);
    }

    pub fn messages_seen(&self) -> u64 {
        self.messages_seen.load(Ordering::Relaxed)
    }

    pub fn messages_filtered(&self) -> u64 {
        self.messages_filtered.load(Ordering::Relaxed)
    }
}
