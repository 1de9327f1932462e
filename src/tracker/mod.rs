//! The tracking engine.
//!
//! A [`Tracker`] owns the projects, the sighting registry and the external
//! services. [`Tracker::start`] spawns the worker pool and the periodic sweep
//! and returns a [`RunningTracker`] whose [`stop`](RunningTracker::stop)
//! drains, evicts everything and closes every project session.

mod notify;
mod process;
mod sweep;

pub use sweep::SweepReport;

use anyhow::{Result, bail};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::country::{CountryLookup, FlydentCountryLookup};
use crate::email::{LogNotifier, Notifier};
use crate::geocoding::{NoopGeocoder, ReverseGeocoder};
use crate::listener::TrackerListener;
use crate::message::Message;
use crate::project::{Project, ProjectDefinition};
use crate::registry::SightingRegistry;
use crate::store::SightingStore;

/// External collaborators of the engine
#[derive(Clone)]
pub struct TrackerServices {
    pub store: Arc<dyn SightingStore>,
    pub notifier: Arc<dyn Notifier>,
    pub geocoder: Arc<dyn ReverseGeocoder>,
    pub countries: Arc<dyn CountryLookup>,
    pub listeners: Vec<Arc<dyn TrackerListener>>,
    pub clock: Arc<dyn Clock>,
}

impl TrackerServices {
    /// Log-only notifier, no geocoder, flydent countries and the system clock
    pub fn new(store: Arc<dyn SightingStore>) -> Self {
        Self {
            store,
            notifier: Arc::new(LogNotifier),
            geocoder: Arc::new(NoopGeocoder),
            countries: Arc::new(FlydentCountryLookup::new()),
            listeners: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_countries(mut self, countries: Arc<dyn CountryLookup>) -> Self {
        self.countries = countries;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TrackerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct Tracker {
    config: TrackerConfig,
    projects: Vec<Project>,
    registry: SightingRegistry,
    services: TrackerServices,
}

impl Tracker {
    /// Validate the configuration and open one persisted session per project.
    ///
    /// Fails before any message is processed when the configuration is
    /// invalid or a session cannot be opened.
    pub async fn new(
        config: TrackerConfig,
        definitions: Vec<ProjectDefinition>,
        services: TrackerServices,
    ) -> Result<Self> {
        config.validate()?;

        let mut names = HashSet::new();
        for definition in &definitions {
            if !names.insert(definition.name.as_str()) {
                bail!("duplicate project name '{}'", definition.name);
            }
            if definition.reopen.enabled && definition.reopen.interval <= chrono::Duration::zero()
            {
                bail!(
                    "project '{}' enables reopen with a non-positive interval",
                    definition.name
                );
            }
        }

        let now = services.clock.now();
        let mut projects = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let session = services.store.open_session(&definition.name, now).await?;
            let project = Project::new(definition, session);
            for listener in &services.listeners {
                listener.project_activated(&project);
            }
            projects.push(project);
        }

        info!(
            projects = projects.len(),
            workers = config.workers,
            timeout_secs = config.sighting_timeout.num_seconds(),
            "tracker initialised"
        );

        Ok(Self {
            config,
            projects,
            registry: SightingRegistry::new(),
            services,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Projects in declaration order
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name() == name)
    }

    pub fn registry(&self) -> &SightingRegistry {
        &self.registry
    }

    fn project_by_session(&self, session_id: uuid::Uuid) -> Option<&Project> {
        self.projects.iter().find(|p| p.session_id() == session_id)
    }

    /// Spawn the worker pool and the sweep task.
    ///
    /// Workers share one rendezvous channel: a send completes only once a
    /// worker has taken the message.
    pub fn start(self: Arc<Self>) -> RunningTracker {
        let (sender, receiver) = flume::bounded::<Message>(0);

        info!("Spawning {} tracker workers", self.config.workers);
        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let tracker = self.clone();
            let receiver = receiver.clone();

            workers.push(tokio::spawn(async move {
                while let Ok(message) = receiver.recv_async().await {
                    // No spans on the hot path, metrics only
                    let start_time = std::time::Instant::now();
                    match tracker.handle_message(&message).await {
                        Ok(()) => {}
                        // already reported at error level
                        Err(e) if e.is_invariant() => {}
                        Err(e) => {
                            warn!(icao = %message.icao, "Message rejected: {}", e);
                            metrics::counter!("tracker.messages.errors_total", "kind" => e.kind())
                                .increment(1);
                        }
                    }
                    metrics::histogram!("tracker.process_message_ms")
                        .record(start_time.elapsed().as_secs_f64() * 1000.0);
                    metrics::counter!("tracker.messages.processed_total").increment(1);
                }
                tracing::debug!("Tracker worker {} stopped", worker_id);
            }));
        }

        let cancel = CancellationToken::new();
        let sweep = self.clone().spawn_sweeper(cancel.clone());

        RunningTracker {
            tracker: self,
            sender,
            workers,
            sweep_cancel: cancel,
            sweep,
        }
    }

    fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the first tick which fires immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let report = self.sweep().await;
                            if report.evicted > 0 || report.removed > 0 {
                                info!(
                                    evicted = report.evicted,
                                    removed = report.removed,
                                    busy = report.busy,
                                    "sweep finished"
                                );
                            }
                        }
                    }
                }
                info!("Sweep task stopped");
            }
            .instrument(tracing::info_span!("tracker_sweep")),
        )
    }

    /// Evict every remaining aircraft and close every project session.
    ///
    /// Workers must already be stopped. Sessions are closed and listeners
    /// notified even when the final eviction fails; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        match self.evict_all().await {
            Ok(evicted) => info!(evicted, "evicted all remaining aircraft"),
            Err(e) => {
                error!("Final eviction failed: {}", e);
                first_error = Some(anyhow::Error::from(e));
            }
        }

        let now = self.services.clock.now();
        for project in &self.projects {
            match self
                .services
                .store
                .close_session(project.session_id(), now)
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    warn!(project = %project.name(), "Failed to close session: {:#}", e);
                    first_error.get_or_insert(e);
                }
            }
            for listener in &self.services.listeners {
                listener.project_deactivated(project);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Handle on a started tracker
pub struct RunningTracker {
    tracker: Arc<Tracker>,
    sender: flume::Sender<Message>,
    workers: Vec<JoinHandle<()>>,
    sweep_cancel: CancellationToken,
    sweep: JoinHandle<()>,
}

impl RunningTracker {
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Producer side of the delivery queue. Workers stop once every sender,
    /// including the one held here, has been dropped.
    pub fn sender(&self) -> flume::Sender<Message> {
        self.sender.clone()
    }

    /// Deliver one message, waiting until a worker has picked it up
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send_async(message)
            .await
            .map_err(|_| anyhow::anyhow!("tracker workers have stopped"))
    }

    /// Close the queue, wait for workers to drain, cancel the sweep, then
    /// evict everything and close all sessions
    pub async fn stop(self) -> Result<()> {
        let RunningTracker {
            tracker,
            sender,
            workers,
            sweep_cancel,
            sweep,
        } = self;

        drop(sender);
        info!("Waiting for {} workers to drain", workers.len());
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Tracker worker panicked: {}", e);
            }
        }

        sweep_cancel.cancel();
        if let Err(e) = sweep.await {
            error!("Sweep task panicked: {}", e);
        }

        tracker.shutdown().await
    }
}
