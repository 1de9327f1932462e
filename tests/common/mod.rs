//! Shared fixtures for tracker integration tests
//!
//! Every test gets its own in-memory store and a manual clock so timeouts
//! and reopen intervals can be driven without sleeping.

#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use skywatch::clock::ManualClock;
use skywatch::config::TrackerConfig;
use skywatch::country::CountryLookup;
use skywatch::email::{EmailJob, Notifier};
use skywatch::geocoding::{ReverseGeocodeResult, ReverseGeocoder};
use skywatch::listener::TrackerListener;
use skywatch::project::{Project, ProjectDefinition};
use skywatch::sighting::Sighting;
use skywatch::store::MemoryStore;
use skywatch::{Message, Tracker, TrackerServices};

pub const TIMEOUT_SECS: i64 = 30;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// 30 s timeout, two confirmations, small batches so paging is exercised
pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        workers: 4,
        sighting_timeout: Duration::seconds(TIMEOUT_SECS),
        on_ground_confirmations: 2,
        path_batch_size: 2,
        ..TrackerConfig::default()
    }
}

/// Airborne position report
pub fn position(icao: &str, altitude: i32, latitude: f64, longitude: f64) -> Message {
    Message {
        altitude: Some(altitude.to_string()),
        latitude: Some(latitude.to_string()),
        longitude: Some(longitude.to_string()),
        ..Message::new("beast", icao)
    }
}

pub fn identification(icao: &str, call_sign: &str) -> Message {
    Message {
        call_sign: Some(call_sign.to_string()),
        ..Message::new("sbs", icao)
    }
}

pub fn ground_report(icao: &str, on_ground: bool) -> Message {
    Message {
        is_on_ground: on_ground,
        ..Message::new("beast", icao)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    jobs: Mutex<Vec<EmailJob>>,
}

impl RecordingNotifier {
    pub fn jobs(&self) -> Vec<EmailJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.jobs().into_iter().map(|job| job.subject).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn queue(&self, job: EmailJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Activated(String),
    Deactivated(String),
    FirstSeen(String, String),
    Updated(String, String),
    Lost(String, String),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl TrackerListener for RecordingListener {
    fn project_activated(&self, project: &Project) {
        self.push(Event::Activated(project.name().to_string()));
    }

    fn project_deactivated(&self, project: &Project) {
        self.push(Event::Deactivated(project.name().to_string()));
    }

    fn aircraft_first_seen(&self, project: &Project, sighting: &Sighting) {
        self.push(Event::FirstSeen(
            project.name().to_string(),
            sighting.icao.clone(),
        ));
    }

    fn aircraft_updated(&self, project: &Project, sighting: &Sighting) {
        self.push(Event::Updated(
            project.name().to_string(),
            sighting.icao.clone(),
        ));
    }

    fn aircraft_lost(&self, project: &Project, sighting: &Sighting) {
        self.push(Event::Lost(project.name().to_string(), sighting.icao.clone()));
    }
}

/// Answers every lookup with the same label, or fails when asked to
pub struct StaticGeocoder {
    label: String,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticGeocoder {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseGeocoder for StaticGeocoder {
    async fn reverse_geocode(
        &self,
        _latitude: f64,
        _longitude: f64,
    ) -> Result<ReverseGeocodeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("geocoder unavailable");
        }
        Ok(ReverseGeocodeResult {
            label: self.label.clone(),
            distance_m: 120.0,
        })
    }
}

/// Every aircraft comes from the same country
pub struct StaticCountryLookup(pub Option<&'static str>);

#[async_trait]
impl CountryLookup for StaticCountryLookup {
    async fn determine_country(&self, _icao: &str) -> Result<Option<String>> {
        Ok(self.0.map(str::to_string))
    }
}

/// A tracker wired to recording collaborators
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub listener: Arc<RecordingListener>,
    pub geocoder: Arc<StaticGeocoder>,
    pub tracker: Arc<Tracker>,
}

impl Harness {
    pub async fn new(definitions: Vec<ProjectDefinition>) -> Self {
        Self::with_config(test_config(), definitions).await
    }

    pub async fn with_config(config: TrackerConfig, definitions: Vec<ProjectDefinition>) -> Self {
        Self::build(config, definitions, StaticGeocoder::new("Testville, Kent, United Kingdom"))
            .await
    }

    pub async fn build(
        config: TrackerConfig,
        definitions: Vec<ProjectDefinition>,
        geocoder: StaticGeocoder,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = Arc::new(RecordingListener::default());
        let geocoder = Arc::new(geocoder);

        let services = TrackerServices::new(store.clone())
            .with_notifier(notifier.clone())
            .with_geocoder(geocoder.clone())
            .with_countries(Arc::new(StaticCountryLookup(Some("GB"))))
            .with_listener(listener.clone())
            .with_clock(clock.clone());

        let tracker = Tracker::new(config, definitions, services)
            .await
            .expect("tracker should start");

        Self {
            store,
            clock,
            notifier,
            listener,
            geocoder,
            tracker: Arc::new(tracker),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(Duration::seconds(seconds));
    }

    pub fn project(&self, name: &str) -> &Project {
        self.tracker.project(name).expect("project exists")
    }

    pub async fn send(&self, message: Message) {
        self.tracker
            .handle_message(&message)
            .await
            .expect("message should be accepted");
    }
}
