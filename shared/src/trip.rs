//! Trip lifecycle: legal transitions and the single active trip.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::evidence::EvidencePurpose;
use crate::model::{AssetId, OperatorId, Trip, TripId, TripStatus};
use crate::{AppError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TripEvent {
    Request,
    Start,
    SendReading,
    Complete,
}

impl TripEvent {
    pub const ALL: [TripEvent; 4] = [
        TripEvent::Request,
        TripEvent::Start,
        TripEvent::SendReading,
        TripEvent::Complete,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TripEvent::Request => "request",
            TripEvent::Start => "start",
            TripEvent::SendReading => "send_reading",
            TripEvent::Complete => "complete",
        }
    }
}

impl fmt::Display for TripEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: TripStatus,
    pub event: TripEvent,
    pub to: TripStatus,
    pub purpose: Option<EvidencePurpose>,
}

static TRANSITIONS: [TransitionRule; 4] = [
    TransitionRule {
        from: TripStatus::Pending,
        event: TripEvent::Request,
        to: TripStatus::Requested,
        purpose: None,
    },
    TransitionRule {
        from: TripStatus::Requested,
        event: TripEvent::Start,
        to: TripStatus::InProgress,
        purpose: Some(EvidencePurpose::Start),
    },
    TransitionRule {
        from: TripStatus::InProgress,
        event: TripEvent::SendReading,
        to: TripStatus::InProgress,
        purpose: Some(EvidencePurpose::Continuous),
    },
    TransitionRule {
        from: TripStatus::InProgress,
        event: TripEvent::Complete,
        to: TripStatus::Completed,
        purpose: Some(EvidencePurpose::Complete),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {event} a trip that is {from}")]
pub struct TransitionError {
    pub from: TripStatus,
    pub event: TripEvent,
}

pub fn rule_for(from: TripStatus, event: TripEvent) -> Result<&'static TransitionRule, TransitionError> {
    TRANSITIONS
        .iter()
        .find(|rule| rule.from == from && rule.event == event)
        .ok_or(TransitionError { from, event })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TripError {
    #[error("trip {0} is not assigned to this driver")]
    UnknownTrip(TripId),

    #[error("trip {trip_id}: {source}")]
    Transition {
        trip_id: TripId,
        #[source]
        source: TransitionError,
    },

    #[error("trip {active} is already in progress, finish it before starting {requested}")]
    ConflictingActiveTrip { requested: TripId, active: TripId },

    #[error("trip {trip_id} moved to {actual} while the {event} was in flight")]
    StaleTransition {
        trip_id: TripId,
        event: TripEvent,
        actual: TripStatus,
    },

    #[error("{event} needs odometer evidence")]
    EvidenceRequired { event: TripEvent },
}

impl From<TripError> for AppError {
    fn from(e: TripError) -> Self {
        let kind = match &e {
            TripError::UnknownTrip(_) => ErrorKind::NotFound,
            TripError::ConflictingActiveTrip { .. } => ErrorKind::Conflict,
            TripError::Transition { .. }
            | TripError::StaleTransition { .. }
            | TripError::EvidenceRequired { .. } => ErrorKind::InvalidState,
        };
        AppError::new(kind, e.to_string())
    }
}

/// A legal transition checked against the current status, awaiting
/// acknowledgement from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransition {
    pub trip_id: TripId,
    pub event: TripEvent,
    pub from: TripStatus,
    pub to: TripStatus,
    pub purpose: Option<EvidencePurpose>,
    pub operator_id: Option<OperatorId>,
    pub asset_id: Option<AssetId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub status: TripStatus,
    pub entered_in_progress: bool,
    pub left_in_progress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub added: usize,
    pub advanced: usize,
    pub regressions_ignored: usize,
    pub removed: usize,
    pub active: Option<TripId>,
}

#[derive(Debug, Default)]
struct TripBook {
    trips: HashMap<TripId, Trip>,
    active: Option<TripId>,
}

/// Trips assigned to the driver plus the active-trip flag. Status only moves
/// forward and only through this type.
#[derive(Debug, Default)]
pub struct TripStateMachine {
    book: RwLock<TripBook>,
}

impl TripStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a backend listing. Known trips never regress; trips missing
    /// from the listing are dropped unless active.
    #[instrument(skip_all, fields(count = listing.len()))]
    pub async fn load(&self, listing: Vec<Trip>) -> LoadSummary {
        let mut book = self.book.write().await;
        let mut summary = LoadSummary::default();

        let mut incoming: HashMap<TripId, Trip> = HashMap::with_capacity(listing.len());
        for trip in listing {
            incoming.insert(trip.id.clone(), trip);
        }

        let active = book.active.clone();
        let before = book.trips.len();
        book.trips
            .retain(|id, _| incoming.contains_key(id) || active.as_ref() == Some(id));
        summary.removed = before - book.trips.len();

        for (id, mut trip) in incoming {
            match book.trips.get(&id) {
                Some(known) if trip.status < known.status => {
                    warn!(trip_id = %id, local = %known.status, remote = %trip.status, "ignoring status regression from backend");
                    trip.status = known.status;
                    summary.regressions_ignored += 1;
                }
                Some(known) if trip.status > known.status => summary.advanced += 1,
                Some(_) => {}
                None => summary.added += 1,
            }
            book.trips.insert(id, trip);
        }

        if let Some(id) = book.active.clone() {
            let still_running = book
                .trips
                .get(&id)
                .is_some_and(|t| t.status == TripStatus::InProgress);
            if !still_running {
                info!(trip_id = %id, "active trip closed by backend");
                book.active = None;
            }
        }

        if book.active.is_none() {
            let mut running: Vec<&TripId> = book
                .trips
                .values()
                .filter(|t| t.status == TripStatus::InProgress)
                .map(|t| &t.id)
                .collect();
            running.sort();
            if running.len() > 1 {
                warn!(count = running.len(), "backend lists several trips in progress, adopting the first");
            }
            let adopted = running.first().map(|id| (*id).clone());
            book.active = adopted;
        }

        summary.active = book.active.clone();
        summary
    }

    pub async fn trip(&self, id: &TripId) -> Option<Trip> {
        self.book.read().await.trips.get(id).cloned()
    }

    /// All trips, ordered by id.
    pub async fn trips(&self) -> Vec<Trip> {
        let book = self.book.read().await;
        let mut trips: Vec<Trip> = book.trips.values().cloned().collect();
        trips.sort_by(|a, b| a.id.cmp(&b.id));
        trips
    }

    pub async fn active_trip(&self) -> Option<TripId> {
        self.book.read().await.active.clone()
    }

    /// Checks that `event` is legal for the trip right now, including the
    /// one-active-trip rule. Nothing changes until `commit`.
    pub async fn begin(&self, id: &TripId, event: TripEvent) -> Result<PendingTransition, TripError> {
        let book = self.book.read().await;
        let trip = book
            .trips
            .get(id)
            .ok_or_else(|| TripError::UnknownTrip(id.clone()))?;
        let rule = rule_for(trip.status, event).map_err(|source| TripError::Transition {
            trip_id: id.clone(),
            source,
        })?;

        if event == TripEvent::Start {
            if let Some(active) = book.active.as_ref().filter(|a| *a != id) {
                return Err(TripError::ConflictingActiveTrip {
                    requested: id.clone(),
                    active: active.clone(),
                });
            }
        }

        Ok(PendingTransition {
            trip_id: id.clone(),
            event,
            from: rule.from,
            to: rule.to,
            purpose: rule.purpose,
            operator_id: trip.operator_id.clone(),
            asset_id: trip.asset_id.clone(),
        })
    }

    /// Pending → Requested. Needs no evidence, so it applies immediately.
    #[instrument(skip(self), fields(trip_id = %id))]
    pub async fn request(&self, id: &TripId) -> Result<TripStatus, TripError> {
        let mut book = self.book.write().await;
        let trip = book
            .trips
            .get_mut(id)
            .ok_or_else(|| TripError::UnknownTrip(id.clone()))?;
        let rule = rule_for(trip.status, TripEvent::Request).map_err(|source| {
            TripError::Transition {
                trip_id: id.clone(),
                source,
            }
        })?;
        trip.status = rule.to;
        info!("trip requested");
        Ok(rule.to)
    }

    /// Applies a backend-acknowledged transition.
    #[instrument(skip(self, pending), fields(trip_id = %pending.trip_id, event = %pending.event))]
    pub async fn commit(&self, pending: &PendingTransition) -> Result<CommitOutcome, TripError> {
        if pending.purpose.is_none() {
            return Err(TripError::EvidenceRequired {
                event: pending.event,
            });
        }

        let mut guard = self.book.write().await;
        let book = &mut *guard;
        let trip = book
            .trips
            .get_mut(&pending.trip_id)
            .ok_or_else(|| TripError::UnknownTrip(pending.trip_id.clone()))?;

        if trip.status != pending.from {
            return Err(TripError::StaleTransition {
                trip_id: pending.trip_id.clone(),
                event: pending.event,
                actual: trip.status,
            });
        }

        let entered = pending.to == TripStatus::InProgress && pending.from != TripStatus::InProgress;
        let left = pending.from == TripStatus::InProgress && pending.to != TripStatus::InProgress;

        if entered {
            if let Some(active) = book.active.as_ref().filter(|a| **a != pending.trip_id) {
                return Err(TripError::ConflictingActiveTrip {
                    requested: pending.trip_id.clone(),
                    active: active.clone(),
                });
            }
        }

        trip.status = pending.to;
        if entered {
            book.active = Some(pending.trip_id.clone());
        }
        if left && book.active.as_ref() == Some(&pending.trip_id) {
            book.active = None;
        }

        info!(status = %pending.to, "transition committed");
        Ok(CommitOutcome {
            status: pending.to,
            entered_in_progress: entered,
            left_in_progress: left,
        })
    }
}
