use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Install the Prometheus recorder and serve `/metrics` on `addr`
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        // Buckets: 0.1ms, 0.5ms, 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("tracker.process_message_ms".to_string()),
            &[0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0],
        )
        .context("failed to set buckets for tracker.process_message_ms")?
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    info!("Metrics available at http://{}/metrics", addr);
    Ok(())
}

/// Background task to update process metrics
/// Updates uptime and memory usage every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize tracker metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_tracker_metrics() {
    metrics::counter!("tracker.messages.processed_total").absolute(0);
    metrics::counter!("tracker.input.malformed_total").absolute(0);
    metrics::counter!("tracker.sightings.created_total").absolute(0);
    metrics::counter!("tracker.sightings.reopened_total").absolute(0);
    metrics::gauge!("tracker.registry.sightings").set(0.0);

    metrics::counter!("tracker.sweep.evicted_total").absolute(0);
    metrics::counter!("tracker.sweep.removed_total").absolute(0);
    metrics::counter!("tracker.sweep.failed_total").absolute(0);

    metrics::counter!("tracker.geocode.found_total").absolute(0);
    metrics::counter!("tracker.geocode.not_found_total").absolute(0);
    metrics::counter!("tracker.geocode.failed_total").absolute(0);

    metrics::counter!("tracker.email.sent_total").absolute(0);
    metrics::counter!("tracker.email.failed_total").absolute(0);
    metrics::counter!("tracker.email.dropped_total").absolute(0);
    metrics::gauge!("tracker.email.queue_depth").set(0.0);
}
