//! Sighting lifecycle: first sighting, updates, eviction and reopen
mod common;

use common::{Event, Harness, TIMEOUT_SECS, identification, position, t0};
use skywatch::project::{Feature, Notification, ProjectDefinition, ReopenPolicy};

fn spotter() -> ProjectDefinition {
    ProjectDefinition::new("spotter")
        .with_feature(Feature::TrackCallsigns)
        .with_feature(Feature::TrackSquawks)
        .with_feature(Feature::TrackFlightPath)
        .with_notification(Notification::SpottedInFlight)
        .with_recipient("ops@example.com")
}

#[tokio::test]
async fn test_first_sighting_opens_row_and_records_sample() {
    let harness = Harness::new(vec![spotter()]).await;

    harness.send(position("4ca1fa", 3500, 51.47, -0.45)).await;

    let project = harness.project("spotter");
    let snapshot = harness.store.snapshot();
    let rows = snapshot.sightings_for(project.session_id());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].opened_at, t0());
    assert!(rows[0].closed_at.is_none());

    let samples = snapshot.samples_for(rows[0].id);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].altitude, 3500);
    assert_eq!(samples[0].latitude, 51.47);

    let subjects = harness.notifier.subjects();
    assert_eq!(subjects, vec!["[spotter] Spotted 4CA1FA".to_string()]);

    assert_eq!(
        harness.listener.events(),
        vec![
            Event::Activated("spotter".into()),
            Event::FirstSeen("spotter".into(), "4CA1FA".into()),
        ]
    );

    // the in-memory sighting is keyed by the canonical address
    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    assert_eq!(sighting.state.country.as_deref(), Some("GB"));
    assert_eq!(sighting.observations.len(), 1);
}

#[tokio::test]
async fn test_call_sign_and_squawk_history() {
    let harness = Harness::new(vec![spotter()]).await;

    harness.send(identification("4CA1FA", "BAW123")).await;
    harness.advance(1);
    let mut squawk = identification("4CA1FA", "BAW123");
    squawk.squawk = Some("7000".to_string());
    harness.send(squawk).await;
    harness.advance(1);
    harness.send(identification("4CA1FA", "BAW124")).await;

    let snapshot = harness.store.snapshot();
    let calls: Vec<&str> = snapshot.call_signs.iter().map(|r| r.value.as_str()).collect();
    assert_eq!(calls, vec!["BAW123", "BAW124"]);
    let squawks: Vec<&str> = snapshot.squawks.iter().map(|r| r.value.as_str()).collect();
    assert_eq!(squawks, vec!["7000"]);

    let row = &snapshot.sightings[0];
    assert_eq!(row.call_sign.as_deref(), Some("BAW124"));
    assert_eq!(row.squawk.as_deref(), Some("7000"));

    assert_eq!(
        harness
            .listener
            .count(|e| matches!(e, Event::Updated(..))),
        2
    );
}

#[tokio::test]
async fn test_duplicate_message_is_idempotent() {
    let harness = Harness::new(vec![spotter()]).await;
    let mut message = position("4CA1FA", 3500, 51.47, -0.45);
    message.call_sign = Some("BAW123".to_string());
    message.squawk = Some("7000".to_string());

    harness.send(message.clone()).await;
    harness.send(message).await;

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.sightings.len(), 1);
    assert_eq!(snapshot.path_samples.len(), 1);
    assert_eq!(snapshot.call_signs.len(), 1);
    assert_eq!(snapshot.squawks.len(), 1);
    assert_eq!(harness.notifier.jobs().len(), 1);
    // nothing changed the second time
    assert_eq!(
        harness
            .listener
            .count(|e| matches!(e, Event::Updated(..))),
        0
    );
}

#[tokio::test]
async fn test_sweep_evicts_only_stale_observations() {
    let harness = Harness::new(vec![spotter()]).await;

    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;
    harness.send(position("400ABC", 9000, 51.10, -0.20)).await;

    harness.advance(TIMEOUT_SECS - 5);
    harness.send(position("400ABC", 9100, 51.11, -0.21)).await;
    harness.advance(10);

    let report = harness.tracker.sweep().await;
    assert_eq!(report.evicted, 1);
    assert_eq!(report.removed, 1);
    assert!(!report.failed);

    assert_eq!(harness.tracker.registry().icaos().await, vec!["400ABC"]);

    let snapshot = harness.store.snapshot();
    let closed: Vec<_> = snapshot
        .sightings
        .iter()
        .filter(|row| row.closed_at.is_some())
        .collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(
        closed[0].closed_at,
        Some(t0() + chrono::Duration::seconds(TIMEOUT_SECS + 5))
    );
    assert_eq!(
        harness.listener.count(|e| matches!(e, Event::Lost(_, icao) if icao == "4CA1FA")),
        1
    );

    // the other aircraft is only evicted once it goes quiet too
    assert_eq!(harness.tracker.sweep().await.evicted, 0);
    harness.advance(TIMEOUT_SECS);
    assert_eq!(harness.tracker.sweep().await.evicted, 1);
    assert!(harness.tracker.registry().is_empty().await);
}

#[tokio::test]
async fn test_failed_batch_close_keeps_observations() {
    let harness = Harness::new(vec![spotter()]).await;
    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;
    harness.advance(TIMEOUT_SECS + 1);

    harness.store.fail_operation("close_sightings");
    let report = harness.tracker.sweep().await;
    assert!(report.failed);
    assert_eq!(report.evicted, 0);
    assert_eq!(harness.tracker.registry().len().await, 1);
    assert!(harness.store.snapshot().sightings[0].closed_at.is_none());

    harness.store.clear_failures();
    let report = harness.tracker.sweep().await;
    assert!(!report.failed);
    assert_eq!(report.evicted, 1);
    assert!(harness.tracker.registry().is_empty().await);
    assert!(harness.store.snapshot().sightings[0].closed_at.is_some());
}

#[tokio::test]
async fn test_reopen_within_interval_continues_row() {
    let project = spotter().with_reopen(ReopenPolicy::within(chrono::Duration::seconds(300)));
    let harness = Harness::new(vec![project]).await;

    harness.send(identification("4CA1FA", "BAW123")).await;
    harness.advance(TIMEOUT_SECS + 1);
    assert_eq!(harness.tracker.sweep().await.evicted, 1);

    // closed at T0+31, back at T0+100
    harness.clock.set(t0() + chrono::Duration::seconds(100));
    harness.send(identification("4CA1FA", "BAW123")).await;

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.sightings.len(), 1);
    assert!(snapshot.sightings[0].closed_at.is_none());
    // the call sign was already on the row
    assert_eq!(snapshot.call_signs.len(), 1);
    // continuing a row is not a first sighting
    assert_eq!(harness.notifier.jobs().len(), 1);
    assert_eq!(
        harness.listener.count(|e| matches!(e, Event::FirstSeen(..))),
        1
    );

    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    let observation = sighting.observations.values().next().unwrap();
    assert_eq!(observation.first_seen, t0());
}

#[tokio::test]
async fn test_reopen_after_interval_starts_new_row() {
    let project = spotter().with_reopen(ReopenPolicy::within(chrono::Duration::seconds(300)));
    let harness = Harness::new(vec![project]).await;

    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;
    harness.advance(TIMEOUT_SECS + 1);
    harness.tracker.sweep().await;

    // closed at T0+31, back at T0+400
    harness.clock.set(t0() + chrono::Duration::seconds(400));
    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.sightings.len(), 2);
    assert_eq!(
        snapshot
            .sightings
            .iter()
            .filter(|row| row.closed_at.is_none())
            .count(),
        1
    );
    assert_eq!(harness.notifier.jobs().len(), 2);
}

#[tokio::test]
async fn test_reopen_disabled_always_starts_new_row() {
    let harness = Harness::new(vec![spotter()]).await;

    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;
    harness.advance(TIMEOUT_SECS + 1);
    harness.tracker.sweep().await;
    harness.advance(1);
    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;

    assert_eq!(harness.store.snapshot().sightings.len(), 2);
}

#[tokio::test]
async fn test_projects_track_independently() {
    let quiet = ProjectDefinition::new("quiet");
    let harness = Harness::new(vec![spotter(), quiet]).await;

    harness.send(position("4CA1FA", 3500, 51.47, -0.45)).await;

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.sessions.len(), 2);
    assert_eq!(snapshot.sightings.len(), 2);
    // only one project records a flight path
    assert_eq!(snapshot.path_samples.len(), 1);
    assert_eq!(
        harness.listener.count(|e| matches!(e, Event::FirstSeen(..))),
        2
    );
}
