//! Fuel request dialog: odometer photo plus reading note, answered with an
//! allocation the driver must see before doing anything else.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument};

use crate::backend::TripBackend;
use crate::capabilities::CameraFacing;
use crate::capture::ImageBlob;
use crate::model::{FuelAllocation, TripId};
use crate::session::{CaptureDialog, SessionError};
use crate::submission::SubmissionOutcome;
use crate::{AppError, ErrorKind};

/// Holds the latest allocation until it has been displayed.
#[derive(Debug, Clone, Default)]
pub struct FuelGate(Arc<Mutex<Option<FuelAllocation>>>);

impl FuelGate {
    fn hold(&self, allocation: FuelAllocation) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(allocation);
    }

    fn release(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    #[must_use]
    pub fn pending(&self) -> Option<FuelAllocation> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn check(&self) -> Result<(), SessionError> {
        match self.pending() {
            Some(allocation) => Err(SessionError::AllocationNotShown {
                trip_id: allocation.trip_id,
                quantity: allocation.quantity,
            }),
            None => Ok(()),
        }
    }
}

pub struct FuelWorkflow<B: TripBackend> {
    dialog: CaptureDialog<B>,
    gate: FuelGate,
    allocation: Option<FuelAllocation>,
    confirmation_delay: Duration,
}

impl<B: TripBackend + 'static> FuelWorkflow<B> {
    pub(crate) fn new(dialog: CaptureDialog<B>, gate: FuelGate, confirmation_delay: Duration) -> Self {
        Self {
            dialog,
            gate,
            allocation: None,
            confirmation_delay,
        }
    }

    #[must_use]
    pub fn trip_id(&self) -> &TripId {
        self.dialog.trip_id()
    }

    #[must_use]
    pub fn dialog(&self) -> &CaptureDialog<B> {
        &self.dialog
    }

    pub async fn capture(&mut self) -> Result<ImageBlob, SessionError> {
        self.dialog.capture().await
    }

    pub async fn recapture(&mut self) -> Result<(), SessionError> {
        self.dialog.recapture().await
    }

    pub async fn toggle_facing(&mut self) -> Result<CameraFacing, SessionError> {
        self.dialog.toggle_facing().await
    }

    /// The reading note is mandatory for fuel.
    pub fn set_reading(&mut self, input: &str) -> Result<(), SessionError> {
        self.dialog.set_reading(input)
    }

    #[must_use]
    pub fn can_submit(&self) -> bool {
        self.allocation.is_none() && self.dialog.can_submit()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&AppError> {
        self.dialog.last_error()
    }

    /// Sends the request. The allocation blocks further trip actions until
    /// shown.
    #[instrument(skip(self), fields(trip_id = %self.dialog.trip_id()))]
    pub async fn submit(&mut self) -> Result<FuelAllocation, SessionError> {
        if let Some(allocation) = &self.allocation {
            return Ok(allocation.clone());
        }

        match self.dialog.submit().await? {
            SubmissionOutcome::Committed {
                fuel: Some(allocation),
                ..
            } => {
                info!(quantity = allocation.quantity, "fuel allocated");
                self.gate.hold(allocation.clone());
                self.allocation = Some(allocation.clone());
                Ok(allocation)
            }
            SubmissionOutcome::Committed { fuel: None, .. } | SubmissionOutcome::Discarded { .. } => {
                Err(SessionError::Backend(AppError::new(
                    ErrorKind::Internal,
                    "fuel request was acknowledged without an allocation",
                )))
            }
        }
    }

    #[must_use]
    pub fn allocation(&self) -> Option<&FuelAllocation> {
        self.allocation.as_ref()
    }

    /// Called once the allocation is on screen.
    pub fn mark_shown(&self) {
        if self.allocation.is_some() {
            self.gate.release();
        }
    }

    /// Leaves the allocation up for the confirmation delay, then closes.
    pub async fn close_after_confirmation(mut self) -> Option<FuelAllocation> {
        if self.allocation.is_some() {
            tokio::time::sleep(self.confirmation_delay).await;
            self.gate.release();
        }
        self.dialog.cancel();
        self.allocation.clone()
    }

    /// Closes without waiting. An allocation already handed to the caller
    /// counts as shown.
    pub fn cancel(mut self) {
        self.dialog.cancel();
    }
}

impl<B: TripBackend> Drop for FuelWorkflow<B> {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            self.gate.release();
        }
    }
}
