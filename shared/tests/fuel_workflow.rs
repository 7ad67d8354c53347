mod common;

use assert_matches::assert_matches;
use std::time::Duration;
use tokio::time::Instant;

use common::{harness, BackendCall, FakeGeolocator};
use tripproof_shared::session::SessionError;
use tripproof_shared::{Trip, TripEvent, TripId, TripStatus};

fn trip_42() -> TripId {
    TripId::new("42")
}

#[tokio::test(start_paused = true)]
async fn fuel_request_returns_allocation_and_closes_after_delay() {
    let h = harness(
        vec![Trip::new("42", TripStatus::InProgress).with_assignment("op-3", "truck-9")],
        FakeGeolocator::at(1.2, 3.4),
    )
    .await;

    let mut fuel = h.session.open_fuel_request(&trip_42()).await.unwrap();
    assert_eq!(fuel.dialog().event(), TripEvent::SendReading);
    fuel.capture().await.unwrap();
    assert!(!fuel.can_submit(), "fuel needs a reading note");
    fuel.set_reading("half tank").unwrap();

    let allocation = fuel.submit().await.unwrap();
    assert_eq!(allocation.quantity, 40.0);
    assert_eq!(allocation.trip_id, trip_42());
    assert!(!fuel.can_submit());

    let writes = h.backend.writes();
    assert_eq!(writes.len(), 1);
    let BackendCall::Fuel(request) = &writes[0] else {
        panic!("expected a fuel request, got {writes:?}");
    };
    let fields = request.text_fields();
    let names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        [
            "f_created_by",
            "f_organization_id",
            "f_operator_id",
            "f_asset_id",
            "f_trip_id",
            "f_reading_note"
        ]
    );
    assert_eq!(request.reading_note, "half tank");
    assert_eq!(request.created_by, "driver-7");

    let started = Instant::now();
    let shown = fuel.close_after_confirmation().await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(shown.map(|a| a.quantity), Some(40.0));

    assert_eq!(h.session.trip(&trip_42()).await.unwrap().status, TripStatus::InProgress);
    assert_eq!(h.camera.counters.live(), 0);
    h.session
        .open_capture(&trip_42(), TripEvent::SendReading)
        .await
        .unwrap();
}

#[tokio::test]
async fn unseen_allocation_blocks_other_actions() {
    let h = harness(
        vec![
            Trip::new("42", TripStatus::InProgress),
            Trip::new("7", TripStatus::Pending),
        ],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;

    let mut fuel = h.session.open_fuel_request(&trip_42()).await.unwrap();
    fuel.capture().await.unwrap();
    fuel.set_reading("20 litres").unwrap();
    fuel.submit().await.unwrap();

    let err = h
        .session
        .open_capture(&trip_42(), TripEvent::Complete)
        .await
        .err()
        .unwrap();
    assert_matches!(err, SessionError::AllocationNotShown { quantity, .. } if quantity == 40.0);
    assert_matches!(
        h.session.request_trip(&TripId::new("7")).await,
        Err(SessionError::AllocationNotShown { .. })
    );

    fuel.mark_shown();
    assert_eq!(
        h.session.request_trip(&TripId::new("7")).await.unwrap(),
        TripStatus::Requested
    );
}

#[tokio::test(start_paused = true)]
async fn cancelling_after_allocation_unblocks_the_trip() {
    let h = harness(
        vec![Trip::new("42", TripStatus::InProgress)],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;

    let mut fuel = h.session.open_fuel_request(&trip_42()).await.unwrap();
    fuel.capture().await.unwrap();
    fuel.set_reading("20 litres").unwrap();
    assert_eq!(fuel.submit().await.unwrap().quantity, 40.0);
    fuel.cancel();

    let mut complete = h
        .session
        .open_capture(&trip_42(), TripEvent::Complete)
        .await
        .unwrap();
    complete.cancel();

    let mut again = h.session.open_fuel_request(&trip_42()).await.unwrap();
    again.capture().await.unwrap();
    again.set_reading("10 litres").unwrap();
    again.submit().await.unwrap();
    drop(again);
    h.session
        .open_capture(&trip_42(), TripEvent::SendReading)
        .await
        .unwrap();
}

#[tokio::test]
async fn fuel_on_requested_trip_starts_it() {
    let h = harness(
        vec![Trip::new("42", TripStatus::Requested)],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;

    let mut fuel = h.session.open_fuel_request(&trip_42()).await.unwrap();
    assert_eq!(fuel.dialog().event(), TripEvent::Start);
    fuel.capture().await.unwrap();
    fuel.set_reading("full").unwrap();
    fuel.submit().await.unwrap();

    assert_eq!(h.session.active_trip().await, Some(trip_42()));
    assert!(h.session.probe().is_periodic_running());
    assert!(h
        .backend
        .writes()
        .iter()
        .all(|c| matches!(c, BackendCall::Fuel(_))));
}

#[tokio::test]
async fn fuel_is_unavailable_outside_active_states() {
    let h = harness(
        vec![
            Trip::new("1", TripStatus::Pending),
            Trip::new("2", TripStatus::Completed),
        ],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;

    for (id, status) in [("1", TripStatus::Pending), ("2", TripStatus::Completed)] {
        let err = h
            .session
            .open_fuel_request(&TripId::new(id))
            .await
            .err()
            .unwrap();
        assert_matches!(err, SessionError::FuelNotAvailable { status: s } if s == status);
    }
    assert_eq!(h.camera.counters.opened(), 0);
}

#[tokio::test]
async fn failed_fuel_request_can_be_resent() {
    let h = harness(
        vec![Trip::new("42", TripStatus::InProgress)],
        FakeGeolocator::at(0.0, 0.0),
    )
    .await;
    h.backend.fail_writes(503);

    let mut fuel = h.session.open_fuel_request(&trip_42()).await.unwrap();
    fuel.capture().await.unwrap();
    fuel.set_reading("low").unwrap();
    assert!(fuel.submit().await.is_err());
    assert!(fuel.last_error().is_some());
    assert!(fuel.allocation().is_none());
    assert!(h.session.request_trip(&trip_42()).await.is_err(), "in progress cannot be requested");

    h.backend.succeed_writes();
    let allocation = fuel.submit().await.unwrap();
    assert_eq!(allocation.quantity, 40.0);
    assert_eq!(h.backend.writes().len(), 2);
}
