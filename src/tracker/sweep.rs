use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Tracker;
use crate::error::{Result, TrackerError};
use crate::registry::{ScanAction, SightingGuard};
use crate::sighting::Sighting;

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Observations closed and removed
    pub evicted: usize,
    /// Sightings dropped from the registry
    pub removed: usize,
    /// Sightings skipped because a worker held them
    pub busy: usize,
    /// The batched close failed and nothing was evicted
    pub failed: bool,
}

/// One lost observation queued for closure
struct Lost {
    guard: usize,
    session_id: Uuid,
    row: Uuid,
}

impl Tracker {
    /// Close out every observation not refreshed within the sighting timeout.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.services.clock.now();
        let timeout = self.config.sighting_timeout;

        let outcome = self
            .registry
            .scan(|sighting| {
                let all_lost = sighting.is_lost(now, timeout);
                if sighting.observations.is_empty() {
                    if all_lost {
                        ScanAction::Remove
                    } else {
                        ScanAction::Release
                    }
                } else if all_lost
                    || sighting
                        .observations
                        .values()
                        .any(|o| o.is_lost(now, timeout))
                {
                    ScanAction::Hold
                } else {
                    ScanAction::Release
                }
            })
            .await;

        let mut report = SweepReport {
            removed: outcome.removed,
            busy: outcome.busy,
            ..Default::default()
        };
        if outcome.held.is_empty() {
            return report;
        }

        match self.evict(outcome.held, now, false).await {
            Ok((evicted, removed)) => {
                report.evicted = evicted;
                report.removed += removed;
            }
            Err(e) => {
                error!("Sweep eviction failed: {}", e);
                metrics::counter!("tracker.sweep.failed_total").increment(1);
                report.failed = true;
            }
        }

        metrics::counter!("tracker.sweep.evicted_total").increment(report.evicted as u64);
        metrics::counter!("tracker.sweep.removed_total").increment(report.removed as u64);
        report
    }

    /// Treat every remaining observation as lost. Used on shutdown.
    pub(super) async fn evict_all(&self) -> Result<usize> {
        let guards = self.registry.drain_all().await;
        let now = self.services.clock.now();
        let (evicted, removed) = self.evict(guards, now, true).await?;
        debug!(evicted, removed, "final eviction finished");
        Ok(evicted)
    }

    /// Close all lost rows in one batch, then finalise each lost observation
    /// while its sighting is still locked.
    ///
    /// Every guard is released before returning, whatever happens. When the
    /// batch close fails nothing is removed and the next sweep retries.
    /// Returns the number of evicted observations and removed sightings.
    async fn evict(
        &self,
        mut guards: Vec<SightingGuard>,
        now: DateTime<Utc>,
        everything: bool,
    ) -> Result<(usize, usize)> {
        let timeout = self.config.sighting_timeout;

        let mut queued = Vec::new();
        for (index, sighting) in guards.iter().enumerate() {
            let all_lost = everything || sighting.is_lost(now, timeout);
            for (session_id, observation) in &sighting.observations {
                if all_lost || observation.is_lost(now, timeout) {
                    queued.push(Lost {
                        guard: index,
                        session_id: *session_id,
                        row: observation.sighting_id,
                    });
                }
            }
        }
        if queued.is_empty() {
            return Ok((0, 0));
        }

        let rows: Vec<Uuid> = queued.iter().map(|lost| lost.row).collect();
        let closed = self.services.store.close_sightings(&rows, now).await?;
        debug!(queued = rows.len(), closed, "closed lost sighting rows");

        let mut evicted = 0;
        let mut invariant = None;
        for lost in queued {
            let sighting: &mut Sighting = &mut guards[lost.guard];
            let Some(project) = self.project_by_session(lost.session_id) else {
                let e = TrackerError::Invariant(format!(
                    "sighting {} is observed by unknown session {}",
                    sighting.icao, lost.session_id
                ));
                error!("{}", e);
                invariant.get_or_insert(e);
                continue;
            };

            match self.notify_lost(project, sighting, lost.session_id).await {
                Ok(()) => {
                    sighting.observations.remove(&lost.session_id);
                    evicted += 1;
                    info!(
                        project = %project.name(),
                        icao = %sighting.icao,
                        row = %lost.row,
                        "sighting closed"
                    );
                    let sighting: &Sighting = sighting;
                    for listener in &self.services.listeners {
                        listener.aircraft_lost(project, sighting);
                    }
                }
                Err(e) if e.is_invariant() => {
                    error!(project = %project.name(), icao = %sighting.icao, "{}", e);
                    invariant.get_or_insert(e);
                }
                Err(e) => {
                    // keep the observation so the next sweep retries
                    warn!(
                        project = %project.name(),
                        icao = %sighting.icao,
                        "Failed to finalise lost sighting: {}",
                        e
                    );
                }
            }
        }

        let emptied: Vec<String> = guards
            .iter()
            .filter(|sighting| sighting.observations.is_empty())
            .map(|sighting| sighting.icao.clone())
            .collect();
        drop(guards);

        let mut removed = 0;
        for icao in &emptied {
            let gone = if everything {
                self.registry.remove_empty(icao).await
            } else {
                self.registry.remove_if_empty(icao, now, timeout).await
            };
            if gone {
                removed += 1;
            }
        }

        match invariant {
            Some(e) => Err(e),
            None => Ok((evicted, removed)),
        }
    }
}
