mod common;

use assert_matches::assert_matches;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use common::{driver, harness, BackendCall, FakeGeolocator, MockBackend};
use tripproof_shared::capabilities::{ImageFormat, PositionOptions};
use tripproof_shared::config::CoreConfig;
use tripproof_shared::session::SessionError;
use tripproof_shared::submission::{DialogLiveness, SubmissionRequest};
use tripproof_shared::{
    ErrorKind, EvidencePurpose, EvidenceRecord, ImageBlob, LatLon, LocationProbe, Reading,
    SubmissionCoordinator, SubmissionError, SubmissionOutcome, Trip, TripError, TripEvent, TripId,
    TripStateMachine, TripStatus,
};

fn trip_42() -> TripId {
    TripId::new("42")
}

#[tokio::test(start_paused = true)]
async fn starting_a_trip_sends_evidence_and_starts_pings() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(1.2, 3.4),
    )
    .await;

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    assert_eq!(dialog.purpose(), EvidencePurpose::Start);
    assert!(dialog.is_streaming());
    assert!(!dialog.can_submit());

    dialog.capture().await.unwrap();
    assert_eq!(h.camera.counters.live(), 0, "capture releases the camera");
    dialog.set_reading("12345").unwrap();
    assert!(dialog.can_submit());

    let outcome = dialog.submit().await.unwrap();
    assert_matches!(
        outcome,
        SubmissionOutcome::Committed { status: TripStatus::InProgress, fuel: None, .. }
    );
    assert!(dialog.is_closed());

    let writes = h.backend.writes();
    assert_eq!(writes.len(), 1);
    let BackendCall::Update(trip_id, body) = &writes[0] else {
        panic!("expected a status update, got {writes:?}");
    };
    assert_eq!(trip_id, &trip_42());
    assert_eq!(body.t_status, "In-Progress");
    assert_eq!(body.or_purpose, EvidencePurpose::Start);
    assert_eq!(body.or_odometer_reading, Some(Reading::Numeric(12345.0)));
    assert_eq!(body.or_latitude, Some(1.2));
    assert_eq!(body.or_longitude, Some(3.4));
    assert!(body.or_odometer_image.starts_with("data:image/png;base64,"));

    assert_eq!(h.session.active_trip().await, Some(trip_42()));
    assert_eq!(h.session.probe().periodic_trip(), Some(trip_42()));

    tokio::time::sleep(Duration::from_secs(10 * 60 + 1)).await;
    let pings = h.backend.pings();
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].purpose, EvidencePurpose::Continuous);
    assert_eq!((pings[0].lat, pings[0].lng), (1.2, 3.4));

    assert_eq!(h.camera.counters.opened(), h.camera.counters.stopped());
}

#[tokio::test(start_paused = true)]
async fn failed_write_keeps_evidence_for_resend() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(1.2, 3.4),
    )
    .await;
    h.backend.fail_writes(500);

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    dialog.capture().await.unwrap();
    dialog.set_reading("12345").unwrap();

    let err = dialog.submit().await.unwrap_err();
    assert_matches!(err, SessionError::Submission(SubmissionError::Failed(ref e)) if e.kind == ErrorKind::Internal);
    assert!(!dialog.is_closed());
    assert!(dialog.evidence().is_some());
    assert_eq!(dialog.last_error().map(|e| e.kind), Some(ErrorKind::Internal));
    assert_eq!(h.session.trip(&trip_42()).await.unwrap().status, TripStatus::Requested);
    assert_eq!(h.session.active_trip().await, None);

    h.backend.succeed_writes();
    let outcome = dialog.submit().await.unwrap();
    assert_matches!(outcome, SubmissionOutcome::Committed { status: TripStatus::InProgress, .. });

    let writes = h.backend.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], writes[1], "the resend carries the same evidence");
    assert_eq!(h.camera.counters.opened(), 1, "no second photo was needed");
}

#[tokio::test]
async fn start_is_refused_while_another_trip_runs() {
    let h = harness(
        vec![
            Trip::new("1", TripStatus::InProgress),
            Trip::new("2", TripStatus::Requested),
        ],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;
    assert_eq!(h.session.active_trip().await, Some(TripId::new("1")));

    let err = h
        .session
        .open_capture(&TripId::new("2"), TripEvent::Start)
        .await
        .err()
        .unwrap();
    assert_matches!(
        err,
        SessionError::Trip(TripError::ConflictingActiveTrip { ref active, .. }) if *active == TripId::new("1")
    );
    assert_eq!(h.camera.counters.opened(), 0);
}

#[tokio::test]
async fn illegal_events_never_open_the_camera() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Pending)],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;

    let err = h
        .session
        .open_capture(&trip_42(), TripEvent::Complete)
        .await
        .err()
        .unwrap();
    assert_matches!(err, SessionError::Trip(TripError::Transition { .. }));

    let err = h
        .session
        .open_capture(&TripId::new("missing"), TripEvent::Start)
        .await
        .err()
        .unwrap();
    assert_matches!(err, SessionError::Trip(TripError::UnknownTrip(_)));
    assert_eq!(h.camera.counters.opened(), 0);

    assert_eq!(h.session.request_trip(&trip_42()).await.unwrap(), TripStatus::Requested);
    assert!(h.backend.writes().is_empty(), "request is a local flip");
}

#[tokio::test(start_paused = true)]
async fn concurrent_submissions_write_once() {
    let backend = MockBackend::with_trips(Vec::new());
    backend.set_latency(Duration::from_secs(1));
    let machine = Arc::new(TripStateMachine::new());
    machine.load(vec![Trip::new("42", TripStatus::Requested)]).await;
    let probe = Arc::new(LocationProbe::new(
        FakeGeolocator::at(0.0, 0.0),
        PositionOptions::default(),
    ));
    let coordinator = SubmissionCoordinator::new(
        Arc::clone(&backend),
        Arc::clone(&machine),
        probe,
        driver(),
        &CoreConfig::default(),
    );

    let pending = machine.begin(&trip_42(), TripEvent::Start).await.unwrap();
    let request = SubmissionRequest::for_transition(pending);
    let evidence = EvidenceRecord::from_parts(
        EvidencePurpose::Start,
        ImageBlob::from_parts(Bytes::from_static(b"\x89PNG\r\n\x1a\n"), ImageFormat::Png, 1, 1),
        Some(Reading::Numeric(100.0)),
        Some(LatLon::new(1.0, 2.0).unwrap()),
        tripproof_shared::model::UnixTimeMs(1_700_000_000_000),
    );
    let liveness = DialogLiveness::new();

    let (first, second) = tokio::join!(
        coordinator.submit(&request, &evidence, &liveness),
        coordinator.submit(&request, &evidence, &liveness),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(SubmissionError::Duplicate { .. }))));
    assert_eq!(backend.writes().len(), 1);
    assert!(!coordinator.is_in_flight(&trip_42()));

    let again = coordinator.submit(&request, &evidence, &liveness).await;
    assert_matches!(again, Err(SubmissionError::Duplicate { .. }));
    assert_eq!(backend.writes().len(), 1, "acknowledged evidence is not resent");
}

#[tokio::test]
async fn denied_location_sends_null_coordinates() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::denied(),
    )
    .await;

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    dialog.capture().await.unwrap();
    dialog.set_reading("12345").unwrap();
    dialog.submit().await.unwrap();

    let writes = h.backend.writes();
    let BackendCall::Update(_, body) = &writes[0] else {
        panic!("expected a status update");
    };
    assert_eq!(body.or_latitude, None);
    let json = serde_json::to_value(body).unwrap();
    assert!(json["or_latitude"].is_null());
    assert!(json["or_longitude"].is_null());
}

#[tokio::test(start_paused = true)]
async fn readings_then_completion_stop_the_probe() {
    let h = harness(
        vec![Trip::new("42", TripStatus::InProgress).with_assignment("op-3", "truck-9")],
        FakeGeolocator::at(5.0, 6.0),
    )
    .await;
    assert!(h.session.probe().is_periodic_running());

    let mut reading = h
        .session
        .open_capture(&trip_42(), TripEvent::SendReading)
        .await
        .unwrap();
    reading.capture().await.unwrap();
    assert!(reading.can_submit(), "mid-trip readings are optional");
    let outcome = reading.submit().await.unwrap();
    assert_matches!(outcome, SubmissionOutcome::Committed { status: TripStatus::InProgress, .. });

    let mut complete = h
        .session
        .open_capture(&trip_42(), TripEvent::Complete)
        .await
        .unwrap();
    complete.capture().await.unwrap();
    assert!(!complete.can_submit(), "completion needs a reading");
    complete.set_reading("12500").unwrap();
    let outcome = complete.submit().await.unwrap();
    assert_matches!(outcome, SubmissionOutcome::Committed { status: TripStatus::Completed, .. });

    let writes = h.backend.writes();
    assert_eq!(writes.len(), 2);
    let BackendCall::Odometer(body) = &writes[0] else {
        panic!("expected an odometer write, got {writes:?}");
    };
    assert_eq!(body.or_purpose, EvidencePurpose::Continuous);
    assert_eq!(body.or_operator_id.as_ref().map(|o| o.as_str()), Some("op-3"));
    assert_eq!(body.or_asset_id.as_ref().map(|a| a.as_str()), Some("truck-9"));
    assert_matches!(&writes[1], BackendCall::Update(_, b) if b.t_status == "Completed");

    assert_eq!(h.session.active_trip().await, None);
    assert!(!h.session.probe().is_periodic_running());
    assert_eq!(h.camera.counters.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn closing_the_dialog_mid_flight_defers_to_refresh() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(1.2, 3.4),
    )
    .await;
    h.backend.set_latency(Duration::from_secs(5));

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    dialog.capture().await.unwrap();
    dialog.set_reading("12345").unwrap();

    let pending = tokio::time::timeout(Duration::from_secs(1), dialog.submit()).await;
    assert!(pending.is_err(), "write still in flight");
    dialog.cancel();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.backend.writes().len(), 1, "the write still completed");
    assert_eq!(h.session.trip(&trip_42()).await.unwrap().status, TripStatus::Requested);

    h.backend.set_trips(vec![Trip::new("42", TripStatus::InProgress)]);
    let summary = h.session.refresh_trips().await.unwrap();
    assert_eq!(summary.advanced, 1);
    assert_eq!(h.session.active_trip().await, Some(trip_42()));
    assert!(h.session.probe().is_periodic_running());
}

#[tokio::test]
async fn cancelling_releases_camera() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    assert_eq!(h.camera.counters.live(), 1);
    dialog.cancel();
    assert_eq!(h.camera.counters.live(), 0);
    assert_matches!(dialog.submit().await, Err(SessionError::Closed));

    let dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    drop(dialog);
    assert_eq!(h.camera.counters.live(), 0);
    assert!(h.backend.writes().is_empty());
}

#[tokio::test]
async fn camera_permission_denied_surfaces_as_evidence_error() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;
    h.camera.deny_permission();

    let err = h
        .session
        .open_capture(&trip_42(), TripEvent::Start)
        .await
        .err()
        .unwrap();
    let app: tripproof_shared::AppError = err.into();
    assert_eq!(app.kind, ErrorKind::CameraPermissionDenied);
}

#[tokio::test]
async fn recapture_after_failed_submit_reopens_camera() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(1.2, 3.4),
    )
    .await;
    h.backend.fail_writes(500);

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    dialog.capture().await.unwrap();
    dialog.set_reading("12345").unwrap();
    dialog.submit().await.unwrap_err();
    assert!(dialog.evidence().is_some());

    dialog.recapture().await.unwrap();
    assert!(dialog.evidence().is_none());
    assert!(!dialog.is_closed());
    assert!(dialog.is_streaming());
    assert_eq!(h.camera.counters.live(), 1);
    assert!(!dialog.can_submit(), "the new photo is still missing");

    dialog.capture().await.unwrap();
    assert!(dialog.can_submit(), "the reading survives the reopen");

    h.backend.succeed_writes();
    let outcome = dialog.submit().await.unwrap();
    assert_matches!(outcome, SubmissionOutcome::Committed { status: TripStatus::InProgress, .. });

    let writes = h.backend.writes();
    assert_eq!(writes.len(), 2);
    let BackendCall::Update(_, body) = &writes[1] else {
        panic!("expected a status update, got {writes:?}");
    };
    assert_eq!(body.or_odometer_reading, Some(Reading::Numeric(12345.0)));
    assert_eq!(h.camera.counters.opened(), 2);
    assert_eq!(h.camera.counters.live(), 0);
}

#[tokio::test]
async fn rejected_reading_is_corrected_without_new_photo() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(1.2, 3.4),
    )
    .await;
    h.backend.fail_writes(400);

    let mut dialog = h.session.open_capture(&trip_42(), TripEvent::Start).await.unwrap();
    dialog.capture().await.unwrap();
    dialog.set_reading("12345").unwrap();
    let err = dialog.submit().await.unwrap_err();
    assert_matches!(err, SessionError::Submission(SubmissionError::Failed(ref e)) if e.kind == ErrorKind::Validation);
    let first_id = dialog.evidence().unwrap().id().clone();

    assert_matches!(
        dialog.set_reading("   "),
        Err(SessionError::Evidence(tripproof_shared::evidence::EvidenceError::MissingReading { .. }))
    );
    assert_eq!(dialog.evidence().unwrap().id(), &first_id, "a refused edit keeps the record");

    dialog.set_reading("12346").unwrap();
    let kept = dialog.evidence().unwrap();
    assert_eq!(kept.reading(), Some(&Reading::Numeric(12346.0)));
    assert_ne!(kept.id(), &first_id);
    assert_eq!(kept.location(), Some(LatLon::new(1.2, 3.4).unwrap()));

    h.backend.succeed_writes();
    dialog.submit().await.unwrap();

    let writes = h.backend.writes();
    let BackendCall::Update(_, body) = &writes[1] else {
        panic!("expected a status update, got {writes:?}");
    };
    assert_eq!(body.or_odometer_reading, Some(Reading::Numeric(12346.0)));
    assert_eq!(h.camera.counters.opened(), 1);
}
