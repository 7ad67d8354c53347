//! One backend write per (trip, transition, evidence record).

use async_trait::async_trait;
use lru::LruCache;
use metrics::{counter, histogram};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::backend::{FuelRequest, LocationPing, OdometerBody, StatusUpdateBody, TripBackend};
use crate::config::CoreConfig;
use crate::evidence::{EvidencePurpose, EvidenceRecord};
use crate::location::{LocationProbe, LocationSink, PeriodicStart};
use crate::model::{DriverIdentity, EvidenceId, FuelAllocation, LatLon, TripId, TripStatus, UnixTimeMs};
use crate::trip::{PendingTransition, TripError, TripEvent, TripStateMachine};
use crate::{AppError, ErrorKind, ACKNOWLEDGED_EVIDENCE_CACHE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionChannel {
    /// `POST /trips/{org}/{user}/{trip}` with the new status.
    TripStatus,
    /// `POST /trips/odometer/{org}/{user}`, status unchanged.
    Odometer,
    /// `POST /fuel/create`, answered with an allocation.
    Fuel,
}

impl SubmissionChannel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SubmissionChannel::TripStatus => "trip_status",
            SubmissionChannel::Odometer => "odometer",
            SubmissionChannel::Fuel => "fuel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub pending: PendingTransition,
    pub channel: SubmissionChannel,
}

impl SubmissionRequest {
    /// Mid-trip readings go to the odometer endpoint, everything else updates the trip.
    #[must_use]
    pub fn for_transition(pending: PendingTransition) -> Self {
        let channel = if pending.event == TripEvent::SendReading {
            SubmissionChannel::Odometer
        } else {
            SubmissionChannel::TripStatus
        };
        Self { pending, channel }
    }

    #[must_use]
    pub fn fuel(pending: PendingTransition) -> Self {
        Self {
            pending,
            channel: SubmissionChannel::Fuel,
        }
    }

    #[must_use]
    pub fn trip_id(&self) -> &TripId {
        &self.pending.trip_id
    }
}

/// Shared open/closed flag between a dialog and its background submission.
#[derive(Debug, Clone)]
pub struct DialogLiveness(Arc<AtomicBool>);

impl DialogLiveness {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for DialogLiveness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Committed {
        trip_id: TripId,
        status: TripStatus,
        fuel: Option<FuelAllocation>,
    },
    /// The backend accepted the write but the dialog had already closed.
    Discarded { trip_id: TripId },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmissionError {
    #[error("a submission for trip {trip_id} is already in flight or acknowledged")]
    Duplicate { trip_id: TripId },

    #[error("submission failed: {0}")]
    Failed(AppError),

    #[error(transparent)]
    Trip(#[from] TripError),

    #[error("evidence for {actual} cannot back a transition expecting {expected:?}")]
    PurposeMismatch {
        expected: Option<EvidencePurpose>,
        actual: EvidencePurpose,
    },
}

impl SubmissionError {
    /// Duplicates are swallowed; the first submission reports for both.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, SubmissionError::Duplicate { .. })
    }
}

impl From<SubmissionError> for AppError {
    fn from(e: SubmissionError) -> Self {
        match e {
            SubmissionError::Failed(e) => e,
            SubmissionError::Trip(e) => e.into(),
            SubmissionError::Duplicate { .. } => AppError::new(ErrorKind::Conflict, e.to_string()),
            SubmissionError::PurposeMismatch { .. } => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<TripId>>,
    trip_id: TripId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<TripId>>, trip_id: &TripId) -> Option<Self> {
        let mut in_flight = set.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(trip_id.clone()) {
            return None;
        }
        Some(Self {
            set,
            trip_id: trip_id.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.set.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.trip_id);
    }
}

/// Forwards periodic fixes for the active trip to the backend.
struct PingSink<B> {
    backend: Arc<B>,
    identity: DriverIdentity,
    trip_id: TripId,
}

#[async_trait]
impl<B: TripBackend + 'static> LocationSink for PingSink<B> {
    async fn on_sample(&self, location: LatLon) {
        let ping = LocationPing::continuous(location);
        match self.backend.ping_location(&self.identity, &self.trip_id, &ping).await {
            Ok(()) => counter!("location.pings_sent").increment(1),
            Err(e) => {
                counter!("location.pings_failed").increment(1);
                warn!(trip_id = %self.trip_id, error = %e, "location ping failed");
            }
        }
    }
}

pub struct SubmissionCoordinator<B: TripBackend> {
    backend: Arc<B>,
    machine: Arc<TripStateMachine>,
    probe: Arc<LocationProbe>,
    identity: DriverIdentity,
    ping_interval: Duration,
    in_flight: Mutex<HashSet<TripId>>,
    acknowledged: Mutex<LruCache<EvidenceId, UnixTimeMs>>,
}

impl<B: TripBackend + 'static> SubmissionCoordinator<B> {
    #[must_use]
    pub fn new(
        backend: Arc<B>,
        machine: Arc<TripStateMachine>,
        probe: Arc<LocationProbe>,
        identity: DriverIdentity,
        config: &CoreConfig,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.submission.acknowledged_cache_size)
            .or(NonZeroUsize::new(ACKNOWLEDGED_EVIDENCE_CACHE))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            backend,
            machine,
            probe,
            identity,
            ping_interval: config.location.periodic_interval(),
            in_flight: Mutex::new(HashSet::new()),
            acknowledged: Mutex::new(LruCache::new(cache_size)),
        }
    }

    #[must_use]
    pub fn is_in_flight(&self, trip_id: &TripId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(trip_id)
    }

    /// Writes the evidence, then applies the transition if the dialog is
    /// still open. A closed dialog leaves the status for the next refresh.
    #[instrument(
        skip(self, request, evidence, liveness),
        fields(trip_id = %request.pending.trip_id, event = %request.pending.event, channel = request.channel.as_str())
    )]
    pub async fn submit(
        &self,
        request: &SubmissionRequest,
        evidence: &EvidenceRecord,
        liveness: &DialogLiveness,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let pending = &request.pending;
        if pending.purpose != Some(evidence.purpose()) {
            return Err(SubmissionError::PurposeMismatch {
                expected: pending.purpose,
                actual: evidence.purpose(),
            });
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &pending.trip_id) else {
            counter!("submission.duplicates").increment(1);
            info!("submission already in flight, suppressed");
            return Err(SubmissionError::Duplicate {
                trip_id: pending.trip_id.clone(),
            });
        };

        if self.is_acknowledged(evidence.id()) {
            counter!("submission.duplicates").increment(1);
            info!(evidence_id = %evidence.id(), "evidence already acknowledged, suppressed");
            return Err(SubmissionError::Duplicate {
                trip_id: pending.trip_id.clone(),
            });
        }

        counter!("submission.attempts", "channel" => request.channel.as_str()).increment(1);
        let started = Instant::now();
        let result = self.write(request, evidence).await;
        histogram!("submission.duration_seconds", "channel" => request.channel.as_str())
            .record(started.elapsed().as_secs_f64());

        let fuel = match result {
            Ok(fuel) => fuel,
            Err(e) => {
                counter!("submission.failures", "channel" => request.channel.as_str()).increment(1);
                warn!(error = %e, retryable = e.is_retryable(), "submission failed");
                return Err(SubmissionError::Failed(e));
            }
        };

        self.acknowledged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(evidence.id().clone(), UnixTimeMs::now());

        if !liveness.is_open() {
            warn!("dialog closed before acknowledgement, result discarded");
            return Ok(SubmissionOutcome::Discarded {
                trip_id: pending.trip_id.clone(),
            });
        }

        let outcome = self.machine.commit(pending).await?;
        if outcome.entered_in_progress {
            self.start_pings(&pending.trip_id);
        }
        if outcome.left_in_progress {
            self.probe.stop_periodic();
        }

        info!(status = %outcome.status, "submission acknowledged");
        Ok(SubmissionOutcome::Committed {
            trip_id: pending.trip_id.clone(),
            status: outcome.status,
            fuel,
        })
    }

    /// Aligns the periodic probe with the active trip after a refresh.
    pub fn sync_periodic(&self, active: Option<&TripId>) {
        match active {
            Some(trip_id) => self.start_pings(trip_id),
            None => {
                self.probe.stop_periodic();
            }
        }
    }

    fn start_pings(&self, trip_id: &TripId) {
        let sink = Arc::new(PingSink {
            backend: Arc::clone(&self.backend),
            identity: self.identity.clone(),
            trip_id: trip_id.clone(),
        });
        if self.probe.start_periodic(trip_id, self.ping_interval, sink) == PeriodicStart::Replaced {
            warn!(trip_id = %trip_id, "periodic probe moved to a new trip");
        }
    }

    fn is_acknowledged(&self, id: &EvidenceId) -> bool {
        self.acknowledged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    async fn write(
        &self,
        request: &SubmissionRequest,
        evidence: &EvidenceRecord,
    ) -> Result<Option<FuelAllocation>, AppError> {
        let pending = &request.pending;
        match request.channel {
            SubmissionChannel::TripStatus => {
                let body = StatusUpdateBody::new(&pending.trip_id, pending.to, evidence);
                self.backend
                    .update_trip(&self.identity, &pending.trip_id, &body)
                    .await?;
                Ok(None)
            }
            SubmissionChannel::Odometer => {
                let body = OdometerBody::new(
                    &pending.trip_id,
                    pending.operator_id.as_ref(),
                    pending.asset_id.as_ref(),
                    evidence,
                );
                self.backend.record_odometer(&self.identity, &body).await?;
                Ok(None)
            }
            SubmissionChannel::Fuel => {
                let fuel = FuelRequest::new(
                    &self.identity,
                    &pending.trip_id,
                    pending.operator_id.as_ref(),
                    pending.asset_id.as_ref(),
                    evidence,
                );
                let allocation = self.backend.request_fuel(&self.identity, &fuel).await?;
                Ok(Some(allocation))
            }
        }
    }
}
