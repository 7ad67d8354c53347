//! Controller façade for one authenticated driver.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::backend::TripBackend;
use crate::capabilities::{CameraDevice, CameraFacing, Geolocator};
use crate::capture::ImageBlob;
use crate::config::CoreConfig;
use crate::evidence::{EvidenceBuilder, EvidenceError, EvidencePurpose, EvidenceRecord, ReadingRequirement};
use crate::fuel::{FuelGate, FuelWorkflow};
use crate::location::LocationProbe;
use crate::model::{DriverIdentity, Trip, TripId, TripStatus};
use crate::submission::{
    DialogLiveness, SubmissionCoordinator, SubmissionError, SubmissionOutcome, SubmissionRequest,
};
use crate::trip::{LoadSummary, TripError, TripEvent, TripStateMachine};
use crate::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Trip(#[from] TripError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("fuel allocation of {quantity} for trip {trip_id} has not been shown yet")]
    AllocationNotShown { trip_id: TripId, quantity: f64 },

    #[error("{event} does not take odometer evidence")]
    NoCaptureNeeded { event: TripEvent },

    #[error("no fuel request can be made for a trip that is {status}")]
    FuelNotAvailable { status: TripStatus },

    #[error("the dialog is closed")]
    Closed,

    #[error(transparent)]
    Backend(AppError),
}

impl SessionError {
    /// Whether the dialog should show this to the driver.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        match self {
            SessionError::Submission(e) => e.is_user_visible(),
            _ => true,
        }
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Trip(e) => e.into(),
            SessionError::Evidence(e) => e.into(),
            SessionError::Submission(e) => e.into(),
            SessionError::Backend(e) => e,
            SessionError::AllocationNotShown { .. }
            | SessionError::NoCaptureNeeded { .. }
            | SessionError::FuelNotAvailable { .. }
            | SessionError::Closed => AppError::new(ErrorKind::InvalidState, e.to_string()),
        }
    }
}

/// Everything one driver needs: trips, camera, location and the backend.
pub struct DriverSession<B: TripBackend> {
    identity: DriverIdentity,
    config: CoreConfig,
    backend: Arc<B>,
    camera: Arc<dyn CameraDevice>,
    machine: Arc<TripStateMachine>,
    probe: Arc<LocationProbe>,
    coordinator: Arc<SubmissionCoordinator<B>>,
    fuel_gate: FuelGate,
}

impl<B: TripBackend + 'static> DriverSession<B> {
    pub fn new(
        identity: DriverIdentity,
        config: CoreConfig,
        backend: Arc<B>,
        camera: Arc<dyn CameraDevice>,
        geolocator: Arc<dyn Geolocator>,
    ) -> AppResult<Self> {
        config.validate()?;

        let machine = Arc::new(TripStateMachine::new());
        let probe = Arc::new(LocationProbe::new(
            geolocator,
            config.location.position_options(),
        ));
        let coordinator = Arc::new(SubmissionCoordinator::new(
            Arc::clone(&backend),
            Arc::clone(&machine),
            Arc::clone(&probe),
            identity.clone(),
            &config,
        ));

        Ok(Self {
            identity,
            config,
            backend,
            camera,
            machine,
            probe,
            coordinator,
            fuel_gate: FuelGate::default(),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn probe(&self) -> &LocationProbe {
        &self.probe
    }

    /// Pulls the trip list and lines up the periodic probe with the active trip.
    #[instrument(skip(self), fields(user = %self.identity.user_id))]
    pub async fn refresh_trips(&self) -> AppResult<LoadSummary> {
        let listing = self.backend.list_trips(&self.identity).await?;
        let summary = self.machine.load(listing).await;
        self.coordinator.sync_periodic(summary.active.as_ref());
        info!(
            added = summary.added,
            advanced = summary.advanced,
            active = ?summary.active,
            "trips refreshed"
        );
        Ok(summary)
    }

    pub async fn trips(&self) -> Vec<Trip> {
        self.machine.trips().await
    }

    pub async fn trip(&self, id: &TripId) -> Option<Trip> {
        self.machine.trip(id).await
    }

    pub async fn active_trip(&self) -> Option<TripId> {
        self.machine.active_trip().await
    }

    pub async fn request_trip(&self, trip_id: &TripId) -> Result<TripStatus, SessionError> {
        self.fuel_gate.check()?;
        Ok(self.machine.request(trip_id).await?)
    }

    /// Opens the odometer dialog for `event`. Every check runs before the
    /// camera is touched.
    #[instrument(skip_all, fields(trip_id = %trip_id, event = %event))]
    pub async fn open_capture(
        &self,
        trip_id: &TripId,
        event: TripEvent,
    ) -> Result<CaptureDialog<B>, SessionError> {
        self.fuel_gate.check()?;
        let pending = self.machine.begin(trip_id, event).await?;
        let purpose = pending
            .purpose
            .ok_or(SessionError::NoCaptureNeeded { event })?;
        let requirement = self.config.readings.for_purpose(purpose);

        self.open_dialog(SubmissionRequest::for_transition(pending), purpose, requirement)
            .await
    }

    /// Fuel requests ride on `start` for a requested trip and on
    /// `sendReading` for one in progress.
    #[instrument(skip_all, fields(trip_id = %trip_id))]
    pub async fn open_fuel_request(&self, trip_id: &TripId) -> Result<FuelWorkflow<B>, SessionError> {
        self.fuel_gate.check()?;
        let trip = self
            .machine
            .trip(trip_id)
            .await
            .ok_or_else(|| TripError::UnknownTrip(trip_id.clone()))?;
        let event = match trip.status {
            TripStatus::Requested => TripEvent::Start,
            TripStatus::InProgress => TripEvent::SendReading,
            status => return Err(SessionError::FuelNotAvailable { status }),
        };
        let pending = self.machine.begin(trip_id, event).await?;
        let purpose = pending
            .purpose
            .ok_or(SessionError::NoCaptureNeeded { event })?;

        let dialog = self
            .open_dialog(
                SubmissionRequest::fuel(pending),
                purpose,
                ReadingRequirement::Required,
            )
            .await?;
        Ok(FuelWorkflow::new(
            dialog,
            self.fuel_gate.clone(),
            self.config.submission.fuel_confirmation_delay(),
        ))
    }

    /// Stops background location work. Open dialogs release on drop.
    pub fn shutdown(&self) {
        if self.probe.stop_periodic() {
            info!("periodic location probe stopped at shutdown");
        }
    }

    async fn open_dialog(
        &self,
        request: SubmissionRequest,
        purpose: EvidencePurpose,
        requirement: ReadingRequirement,
    ) -> Result<CaptureDialog<B>, SessionError> {
        let builder = EvidenceBuilder::open(
            Arc::clone(&self.camera),
            Arc::clone(&self.probe),
            &self.config.capture,
            purpose,
            requirement,
        )
        .await?;

        Ok(CaptureDialog {
            request,
            builder,
            evidence: None,
            coordinator: Arc::clone(&self.coordinator),
            liveness: DialogLiveness::new(),
            last_error: None,
            closed: false,
        })
    }
}

impl<B: TripBackend> Drop for DriverSession<B> {
    fn drop(&mut self) {
        self.probe.stop_periodic();
    }
}

/// One open odometer dialog.
///
/// A failed submit keeps the built record so the driver can resend it
/// without photographing the odometer again.
pub struct CaptureDialog<B: TripBackend> {
    request: SubmissionRequest,
    builder: EvidenceBuilder,
    evidence: Option<EvidenceRecord>,
    coordinator: Arc<SubmissionCoordinator<B>>,
    liveness: DialogLiveness,
    last_error: Option<AppError>,
    closed: bool,
}

impl<B: TripBackend + 'static> CaptureDialog<B> {
    #[must_use]
    pub fn trip_id(&self) -> &TripId {
        self.request.trip_id()
    }

    #[must_use]
    pub fn event(&self) -> TripEvent {
        self.request.pending.event
    }

    #[must_use]
    pub fn purpose(&self) -> EvidencePurpose {
        self.builder.purpose()
    }

    #[must_use]
    pub fn facing(&self) -> CameraFacing {
        self.builder.capture_session().facing()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.builder.capture_session().is_streaming()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    /// Record kept after a failed submit.
    #[must_use]
    pub fn evidence(&self) -> Option<&EvidenceRecord> {
        self.evidence.as_ref()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn capture(&mut self) -> Result<ImageBlob, SessionError> {
        let result = self.builder.capture().await;
        self.track(result)
    }

    /// Takes a new photo. After a failed submit this reopens the camera and
    /// drops the kept record only once the camera is back.
    pub async fn recapture(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let result = if self.evidence.is_some() {
            self.builder.reopen().await
        } else {
            self.builder.recapture().await
        };
        self.track(result)?;
        self.evidence = None;
        Ok(())
    }

    pub async fn toggle_facing(&mut self) -> Result<CameraFacing, SessionError> {
        let result = self.builder.toggle_facing().await;
        self.track(result)
    }

    /// With a kept record the reading is corrected in place, so a rejected
    /// value can be fixed without a new photo.
    pub fn set_reading(&mut self, input: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        match self.evidence.take() {
            Some(kept) => {
                let amended = self.builder.amend_reading(&kept, input);
                self.evidence = Some(kept);
                let record = self.track(amended)?;
                self.evidence = Some(record);
                Ok(())
            }
            None => {
                let result = self.builder.set_reading(input);
                self.track(result)
            }
        }
    }

    #[must_use]
    pub fn can_submit(&self) -> bool {
        !self.closed && (self.evidence.is_some() || self.builder.can_finalize())
    }

    /// Builds the record on first use, then hands it to the coordinator on a
    /// background task so the write finishes even if the dialog goes away.
    pub async fn submit(&mut self) -> Result<SubmissionOutcome, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        let evidence = match self.evidence.clone() {
            Some(evidence) => evidence,
            None => {
                let built = self.builder.finalize().await;
                let evidence = self.track(built)?;
                self.evidence = Some(evidence.clone());
                evidence
            }
        };

        let coordinator = Arc::clone(&self.coordinator);
        let request = self.request.clone();
        let liveness = self.liveness.clone();
        let handle =
            tokio::spawn(async move { coordinator.submit(&request, &evidence, &liveness).await });

        let result = match handle.await {
            Ok(result) => result.map_err(SessionError::from),
            Err(e) => Err(SessionError::Backend(
                AppError::new(ErrorKind::Internal, "submission task stopped")
                    .with_internal(e.to_string()),
            )),
        };

        match result {
            Ok(outcome) => {
                self.finish();
                Ok(outcome)
            }
            Err(e) => {
                if e.is_user_visible() {
                    warn!(trip_id = %self.trip_id(), error = %e, "submission failed, evidence kept for retry");
                    self.last_error = Some(e.clone().into());
                }
                Err(e)
            }
        }
    }

    pub fn cancel(&mut self) {
        self.builder.cancel();
        self.finish();
    }

    fn finish(&mut self) {
        self.liveness.close();
        self.evidence = None;
        self.last_error = None;
        self.closed = true;
    }

    fn track<T>(&mut self, result: Result<T, EvidenceError>) -> Result<T, SessionError> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Ok(value)
            }
            Err(e) => {
                self.last_error = Some(e.clone().into());
                Err(e.into())
            }
        }
    }
}

impl<B: TripBackend> Drop for CaptureDialog<B> {
    fn drop(&mut self) {
        self.liveness.close();
    }
}
