//! In-memory camera, geolocator and backend shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tripproof_shared::backend::{FuelRequest, LocationPing, OdometerBody, StatusUpdateBody};
use tripproof_shared::capabilities::{
    CameraDevice, CameraError, CameraFacing, Frame, GeolocationError, Geolocator, Position,
    PositionOptions, VideoStream,
};
use tripproof_shared::config::CoreConfig;
use tripproof_shared::{
    AppError, AppResult, DriverIdentity, DriverSession, FuelAllocation, LatLon, Trip, TripBackend,
    TripId,
};

#[derive(Default)]
pub struct CameraCounters {
    pub opened: AtomicUsize,
    pub stopped: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl CameraCounters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

struct FakeStream {
    facing: CameraFacing,
    counters: Arc<CameraCounters>,
    stopped: bool,
}

#[async_trait]
impl VideoStream for FakeStream {
    fn facing(&self) -> CameraFacing {
        self.facing
    }

    async fn ready(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<Frame, CameraError> {
        Ok(Frame::Rgba {
            width: 8,
            height: 6,
            pixels: vec![128; 8 * 6 * 4],
        })
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Camera whose streams are counted so tests can check every open is
/// matched by a stop.
#[derive(Default)]
pub struct FakeCamera {
    pub counters: Arc<CameraCounters>,
    deny: AtomicBool,
    missing_front: AtomicBool,
}

impl FakeCamera {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_permission(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn without_front_camera(&self) {
        self.missing_front.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CameraDevice for FakeCamera {
    async fn open(&self, facing: CameraFacing) -> Result<Box<dyn VideoStream>, CameraError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CameraError::PermissionDenied);
        }
        if facing == CameraFacing::Front && self.missing_front.load(Ordering::SeqCst) {
            return Err(CameraError::CameraNotFound { facing });
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            facing,
            counters: Arc::clone(&self.counters),
            stopped: false,
        }))
    }
}

pub struct FakeGeolocator {
    answer: Result<LatLon, GeolocationError>,
    pub calls: AtomicUsize,
}

impl FakeGeolocator {
    pub fn at(lat: f64, lng: f64) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(LatLon::new(lat, lng).unwrap()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            answer: Err(GeolocationError::PermissionDenied),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Geolocator for FakeGeolocator {
    async fn current_position(&self, _options: PositionOptions) -> Result<Position, GeolocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map(|coords| Position {
            coords,
            accuracy_m: Some(4.0),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    List,
    Update(TripId, StatusUpdateBody),
    Odometer(OdometerBody),
    Fuel(FuelRequest),
    Ping(TripId, LocationPing),
}

/// Records every call. Writes can be made to fail or to take a while.
#[derive(Default)]
pub struct MockBackend {
    pub calls: Mutex<Vec<BackendCall>>,
    trips: Mutex<Vec<Trip>>,
    fail_with: Mutex<Option<u16>>,
    latency: Mutex<Duration>,
    fuel_quantity: Mutex<f64>,
}

impl MockBackend {
    pub fn with_trips(trips: Vec<Trip>) -> Arc<Self> {
        let backend = Self::default();
        *backend.trips.lock().unwrap() = trips;
        *backend.fuel_quantity.lock().unwrap() = 40.0;
        Arc::new(backend)
    }

    pub fn set_trips(&self, trips: Vec<Trip>) {
        *self.trips.lock().unwrap() = trips;
    }

    pub fn fail_writes(&self, status: u16) {
        *self.fail_with.lock().unwrap() = Some(status);
    }

    pub fn succeed_writes(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, BackendCall::List | BackendCall::Ping(..)))
            .collect()
    }

    pub fn pings(&self) -> Vec<LocationPing> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Ping(_, ping) => Some(ping),
                _ => None,
            })
            .collect()
    }

    async fn write(&self, call: BackendCall) -> AppResult<()> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().unwrap().push(call);
        match *self.fail_with.lock().unwrap() {
            Some(status) => Err(AppError::from_http_status(status, None)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TripBackend for MockBackend {
    async fn list_trips(&self, _identity: &DriverIdentity) -> AppResult<Vec<Trip>> {
        self.calls.lock().unwrap().push(BackendCall::List);
        Ok(self.trips.lock().unwrap().clone())
    }

    async fn update_trip(
        &self,
        _identity: &DriverIdentity,
        trip_id: &TripId,
        body: &StatusUpdateBody,
    ) -> AppResult<()> {
        self.write(BackendCall::Update(trip_id.clone(), body.clone())).await
    }

    async fn record_odometer(&self, _identity: &DriverIdentity, body: &OdometerBody) -> AppResult<()> {
        self.write(BackendCall::Odometer(body.clone())).await
    }

    async fn request_fuel(
        &self,
        _identity: &DriverIdentity,
        request: &FuelRequest,
    ) -> AppResult<FuelAllocation> {
        self.write(BackendCall::Fuel(request.clone())).await?;
        Ok(FuelAllocation {
            trip_id: request.trip_id.clone(),
            quantity: *self.fuel_quantity.lock().unwrap(),
        })
    }

    async fn ping_location(
        &self,
        _identity: &DriverIdentity,
        trip_id: &TripId,
        ping: &LocationPing,
    ) -> AppResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(BackendCall::Ping(trip_id.clone(), *ping));
        Ok(())
    }
}

pub fn driver() -> DriverIdentity {
    DriverIdentity::new("driver-7", "org-1")
}

pub struct Harness {
    pub session: DriverSession<MockBackend>,
    pub backend: Arc<MockBackend>,
    pub camera: Arc<FakeCamera>,
    pub geolocator: Arc<FakeGeolocator>,
}

pub async fn harness(trips: Vec<Trip>, geolocator: Arc<FakeGeolocator>) -> Harness {
    let backend = MockBackend::with_trips(trips);
    let camera = FakeCamera::new();
    let session = DriverSession::new(
        driver(),
        CoreConfig::default(),
        Arc::clone(&backend),
        camera.clone(),
        geolocator.clone(),
    )
    .unwrap();
    session.refresh_trips().await.unwrap();
    Harness {
        session,
        backend,
        camera,
        geolocator,
    }
}
