//! Message processing: merge, filters, error handling and side effects
mod common;

use common::{Harness, ground_report, identification, position, test_config};
use skywatch::TrackerError;
use skywatch::filter::Expression;
use skywatch::message::Message;
use skywatch::project::{Feature, Notification, ProjectDefinition};
use std::sync::Arc;

#[tokio::test]
async fn test_on_ground_needs_more_than_threshold_confirmations() {
    // threshold of two: the third consecutive report flips the state
    let harness = Harness::new(vec![ProjectDefinition::new("all")]).await;

    harness.send(ground_report("4CA1FA", false)).await;
    for expected in [Some(false), Some(false), Some(true)] {
        harness.send(ground_report("4CA1FA", true)).await;
        let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
        assert_eq!(sighting.state.on_ground, expected);
    }
}

#[tokio::test]
async fn test_alternating_reports_never_flip() {
    let harness = Harness::new(vec![ProjectDefinition::new("all")]).await;

    harness.send(ground_report("4CA1FA", true)).await;
    for i in 0..10 {
        harness.send(ground_report("4CA1FA", i % 2 == 0)).await;
    }

    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    assert_eq!(sighting.state.on_ground, Some(true));
}

#[tokio::test]
async fn test_hysteresis_counts_once_per_message_with_many_projects() {
    let projects = (0..3)
        .map(|i| ProjectDefinition::new(format!("p{}", i)))
        .collect();
    let harness = Harness::new(projects).await;

    harness.send(ground_report("4CA1FA", false)).await;
    harness.send(ground_report("4CA1FA", true)).await;

    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    assert_eq!(sighting.state.on_ground, Some(false));
    assert_eq!(sighting.state.on_ground_count, 1);
}

#[tokio::test]
async fn test_filtered_messages_are_counted_but_not_applied() {
    let filter = Expression::parse("msg.altitude != null && msg.altitude < 10000").unwrap();
    let low = ProjectDefinition::new("low").with_filter(Arc::new(filter));
    let harness = Harness::new(vec![low]).await;

    harness.send(position("4CA1FA", 35000, 51.0, -1.0)).await;
    harness.send(identification("4CA1FA", "BAW123")).await;
    harness.send(position("4CA1FA", 3000, 51.0, -1.0)).await;

    let project = harness.project("low");
    assert_eq!(project.messages_seen(), 3);
    assert_eq!(project.messages_filtered(), 2);

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.sightings.len(), 1);
    // call signs are not tracked by this project
    assert_eq!(snapshot.sightings[0].call_sign, None);

    // the filtered message was still merged into the shared state
    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    assert_eq!(sighting.state.call_sign.as_deref(), Some("BAW123"));
}

#[tokio::test]
async fn test_filter_can_see_merged_state() {
    let filter = Expression::parse(r#"state.call_sign =~ "^BAW""#).unwrap();
    let ba = ProjectDefinition::new("ba").with_filter(Arc::new(filter));
    let harness = Harness::new(vec![ba]).await;

    harness.send(position("4CA1FA", 3000, 51.0, -1.0)).await;
    assert!(harness.store.snapshot().sightings.is_empty());

    harness.send(identification("4CA1FA", "BAW123")).await;
    assert_eq!(harness.store.snapshot().sightings.len(), 1);
}

#[tokio::test]
async fn test_filter_error_is_surfaced_for_single_project() {
    let filter = Expression::parse("msg.call_sign > 5").unwrap();
    let broken = ProjectDefinition::new("broken").with_filter(Arc::new(filter));
    let harness = Harness::new(vec![broken]).await;
    let project = harness.project("broken");

    let result = harness
        .tracker
        .process_message(project, &identification("4CA1FA", "BAW123"))
        .await;
    assert!(matches!(result, Err(TrackerError::Filter(_))));

    // the pool-facing entry point logs and carries on
    harness
        .tracker
        .handle_message(&identification("4CA1FA", "BAW123"))
        .await
        .unwrap();
    assert!(harness.store.snapshot().sightings.is_empty());
}

#[tokio::test]
async fn test_malformed_field_rejects_message_but_touches_sighting() {
    let harness = Harness::new(vec![ProjectDefinition::new("all")]).await;

    let message = Message {
        altitude: Some("FL350".to_string()),
        ..Message::new("beast", "4CA1FA")
    };
    match harness.tracker.handle_message(&message).await {
        Err(TrackerError::InvalidField { field, .. }) => assert_eq!(field, "altitude"),
        other => panic!("expected invalid field, got {:?}", other),
    }

    assert_eq!(harness.tracker.registry().len().await, 1);
    assert!(harness.store.snapshot().sightings.is_empty());
}

#[tokio::test]
async fn test_empty_icao_is_rejected() {
    let harness = Harness::new(vec![ProjectDefinition::new("all")]).await;

    let result = harness
        .tracker
        .handle_message(&Message::new("beast", "  "))
        .await;
    assert!(matches!(
        result,
        Err(TrackerError::InvalidField { field: "icao", .. })
    ));
    assert!(harness.tracker.registry().is_empty().await);
}

#[tokio::test]
async fn test_failed_write_is_retried_by_next_message() {
    let project = ProjectDefinition::new("calls").with_feature(Feature::TrackCallsigns);
    let harness = Harness::new(vec![project]).await;
    let project = harness.project("calls");

    harness.store.fail_operation("insert_call_sign");
    let result = harness
        .tracker
        .process_message(project, &identification("4CA1FA", "BAW123"))
        .await;
    assert!(matches!(result, Err(TrackerError::Persistence(_))));
    assert!(harness.store.snapshot().call_signs.is_empty());

    harness.store.clear_failures();
    harness.send(identification("4CA1FA", "BAW123")).await;

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.call_signs.len(), 1);
    assert_eq!(snapshot.sightings[0].call_sign.as_deref(), Some("BAW123"));
}

#[tokio::test]
async fn test_transmission_types_recorded_once_each() {
    let project = ProjectDefinition::new("types").with_feature(Feature::TrackTransmissionTypes);
    let harness = Harness::new(vec![project]).await;

    for transmission_type in [3, 4, 3, 3, 5] {
        let message = Message {
            transmission_type: Some(transmission_type),
            ..Message::new("sbs", "4CA1FA")
        };
        harness.send(message).await;
    }

    let recorded: Vec<u8> = harness
        .store
        .snapshot()
        .transmission_types
        .iter()
        .map(|r| r.value)
        .collect();
    assert_eq!(recorded, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_takeoff_start_and_complete_emails() {
    let mut config = test_config();
    config.on_ground_confirmations = 1;
    let project = ProjectDefinition::new("departures")
        .with_feature(Feature::TrackTakeoff)
        .with_notification(Notification::TakeoffStart)
        .with_notification(Notification::TakeoffComplete)
        .with_recipient("tower@example.com");
    let harness = Harness::with_config(config, vec![project]).await;

    let climb = |altitude: i32, vertical_rate: i32| Message {
        altitude: Some(altitude.to_string()),
        vertical_rate: Some(vertical_rate.to_string()),
        call_sign: Some("EZY12".to_string()),
        ..Message::new("beast", "4CA1FA")
    };

    harness
        .send(Message {
            altitude: Some("0".to_string()),
            ..ground_report("4CA1FA", true)
        })
        .await;
    harness.send(climb(300, 1500)).await;
    assert!(harness.notifier.jobs().is_empty());

    harness.send(climb(300, 1500)).await;
    assert_eq!(
        harness.notifier.subjects(),
        vec!["[departures] EZY12 (4CA1FA) is taking off".to_string()]
    );

    harness.send(climb(1000, 0)).await;
    let subjects = harness.notifier.subjects();
    assert_eq!(subjects.len(), 2);
    assert_eq!(
        subjects[1],
        "[departures] EZY12 (4CA1FA) has completed its takeoff"
    );
    assert_eq!(harness.notifier.jobs()[1].to, vec!["tower@example.com"]);
}

#[tokio::test]
async fn test_origin_geocoded_once_below_limit() {
    let project = ProjectDefinition::new("geo").with_feature(Feature::GeocodeEndpoints);
    let harness = Harness::new(vec![project]).await;

    harness.send(position("4CA1FA", 1500, 51.47, -0.45)).await;
    harness.send(position("4CA1FA", 2500, 51.48, -0.46)).await;
    assert_eq!(harness.geocoder.calls(), 1);

    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    let origin = sighting
        .observations
        .values()
        .next()
        .and_then(|o| o.origin.clone())
        .unwrap();
    assert!(origin.found);
    assert_eq!(origin.label, "Testville, Kent, United Kingdom");
}

#[tokio::test]
async fn test_origin_above_limit_is_not_geocoded() {
    let project = ProjectDefinition::new("geo").with_feature(Feature::GeocodeEndpoints);
    let harness = Harness::new(vec![project]).await;

    harness.send(position("4CA1FA", 35000, 51.47, -0.45)).await;
    harness.send(position("4CA1FA", 1000, 51.47, -0.45)).await;

    assert_eq!(harness.geocoder.calls(), 0);
    let sighting = harness.tracker.registry().lock("4CA1FA").await.unwrap();
    let origin = sighting
        .observations
        .values()
        .next()
        .and_then(|o| o.origin.clone())
        .unwrap();
    assert!(!origin.found);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_for_one_aircraft() {
    let project = ProjectDefinition::new("paths")
        .with_feature(Feature::TrackFlightPath)
        .with_feature(Feature::TrackCallsigns);
    let harness = Harness::new(vec![project]).await;

    let mut tasks = Vec::new();
    for i in 0..50 {
        let tracker = harness.tracker.clone();
        tasks.push(tokio::spawn(async move {
            let mut message = position("4CA1FA", 1000 + i * 100, 51.0, -1.0);
            message.call_sign = Some("BAW123".to_string());
            tracker.handle_message(&message).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.aircraft.len(), 1);
    assert_eq!(snapshot.sightings.len(), 1);
    assert_eq!(snapshot.call_signs.len(), 1);
    assert_eq!(snapshot.path_samples.len(), 50);
    assert_eq!(harness.project("paths").messages_seen(), 50);
    assert_eq!(harness.tracker.registry().len().await, 1);
}
