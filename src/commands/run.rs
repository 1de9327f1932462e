use anyhow::{Context, Result};
use skywatch::config::TrackerFileConfig;
use skywatch::email::{EmailQueue, EmailService, LogNotifier, Notifier};
use skywatch::geocoding::{NoopGeocoder, NominatimClient, ReverseGeocoder};
use skywatch::listener::LogListener;
use skywatch::source::{open_input, pump_messages};
use skywatch::store::MemoryStore;
use skywatch::tracker::{Tracker, TrackerServices};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

const EMAIL_QUEUE_SIZE: usize = 1000;

#[tracing::instrument(skip_all)]
pub async fn handle_run(
    config_path: &Path,
    input: &Path,
    metrics_addr: Option<SocketAddr>,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    // Startup errors are fatal before any message is read
    let file = TrackerFileConfig::load(config_path)?;
    let config = file.tracker_config()?;
    let definitions = file.project_definitions()?;

    if let Some(addr) = metrics_addr {
        skywatch::metrics::init_metrics(addr)?;
        skywatch::metrics::initialize_tracker_metrics();
        tokio::spawn(
            skywatch::metrics::process_metrics_task()
                .instrument(tracing::info_span!("process_metrics")),
        );
    }

    let store = Arc::new(MemoryStore::new());

    let (notifier, email_worker) = if file.email.enabled {
        let service = EmailService::new().context("Email is enabled but SMTP is not configured")?;
        let (queue, handle) = EmailQueue::spawn(service, EMAIL_QUEUE_SIZE);
        info!("Email notifications enabled");
        let notifier: Arc<dyn Notifier> = Arc::new(queue);
        (notifier, Some(handle))
    } else {
        info!("Email disabled, notifications will only be logged");
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        (notifier, None)
    };

    let geocoder: Arc<dyn ReverseGeocoder> = match &file.geocoder {
        Some(section) => {
            info!("Reverse geocoding via {}", section.base_url);
            Arc::new(NominatimClient::from_config(section)?)
        }
        None => Arc::new(NoopGeocoder),
    };

    let services = TrackerServices::new(store.clone())
        .with_notifier(notifier)
        .with_geocoder(geocoder)
        .with_listener(Arc::new(LogListener));

    let tracker = Arc::new(Tracker::new(config, definitions, services).await?);
    let running = tracker.clone().start();

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                cancel.cancel();
            }
        })
    };

    let reader = open_input(input).await?;
    let pumped = pump_messages(reader, running.sender(), cancel.clone()).await;
    ctrl_c.abort();

    match &pumped {
        Ok(stats) => info!(
            lines = stats.lines,
            delivered = stats.delivered,
            malformed = stats.malformed,
            "input finished"
        ),
        Err(e) => error!("Input failed: {:#}", e),
    }

    let stopped = running.stop().await;
    if let Err(e) = &stopped {
        error!("Shutdown did not complete cleanly: {:#}", e);
    }

    // The email worker exits once the last queue handle, held by the tracker, is gone
    drop(tracker);
    if let Some(handle) = email_worker
        && let Err(e) = handle.await
    {
        warn!("Email worker panicked: {}", e);
    }

    if let Some(path) = snapshot {
        store.write_snapshot(&path)?;
        info!("Wrote store snapshot to {:?}", path);
    }

    pumped?;
    stopped
}
