//! Odometer evidence: photo, optional reading and best-effort location.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::capabilities::{CameraDevice, CameraError, CameraFacing, CaptureConfig};
use crate::capture::{ImageBlob, MediaCaptureSession};
use crate::location::LocationProbe;
use crate::model::{EvidenceId, LatLon, UnixTimeMs};
use crate::{AppError, ErrorKind, MAX_READING_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidencePurpose {
    Start,
    Continuous,
    Complete,
}

impl EvidencePurpose {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EvidencePurpose::Start => "start",
            EvidencePurpose::Continuous => "continuous",
            EvidencePurpose::Complete => "complete",
        }
    }
}

impl fmt::Display for EvidencePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Odometer value as typed by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Numeric(f64),
    Text(String),
}

impl Reading {
    /// Trims the input. Blank clears the reading; finite numbers are numeric.
    pub fn parse(input: &str) -> Result<Option<Self>, EvidenceError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.len() > MAX_READING_LENGTH {
            return Err(EvidenceError::ReadingTooLong {
                len: trimmed.len(),
                max: MAX_READING_LENGTH,
            });
        }
        Ok(Some(match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Reading::Numeric(value),
            _ => Reading::Text(trimmed.to_string()),
        }))
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Numeric(value) => write!(f, "{value}"),
            Reading::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingRequirement {
    Required,
    Optional,
}

/// Which odometer submissions refuse to go out without a reading. Fuel
/// requests always need one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingPolicy {
    pub start: ReadingRequirement,
    pub continuous: ReadingRequirement,
    pub complete: ReadingRequirement,
}

impl Default for ReadingPolicy {
    fn default() -> Self {
        Self {
            start: ReadingRequirement::Required,
            continuous: ReadingRequirement::Optional,
            complete: ReadingRequirement::Required,
        }
    }
}

impl ReadingPolicy {
    #[must_use]
    pub fn for_purpose(&self, purpose: EvidencePurpose) -> ReadingRequirement {
        match purpose {
            EvidencePurpose::Start => self.start,
            EvidencePurpose::Continuous => self.continuous,
            EvidencePurpose::Complete => self.complete,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvidenceError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("no photo has been captured yet")]
    MissingImage,

    #[error("an odometer reading is required for {purpose}")]
    MissingReading { purpose: EvidencePurpose },

    #[error("reading is {len} characters, the limit is {max}")]
    ReadingTooLong { len: usize, max: usize },

    #[error("evidence dialog is already closed")]
    Closed,
}

impl From<EvidenceError> for AppError {
    fn from(e: EvidenceError) -> Self {
        match e {
            EvidenceError::Camera(e) => e.into(),
            EvidenceError::MissingImage
            | EvidenceError::MissingReading { .. }
            | EvidenceError::ReadingTooLong { .. } => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            EvidenceError::Closed => AppError::new(ErrorKind::InvalidState, e.to_string()),
        }
    }
}

/// Immutable evidence bundle handed to the submission path.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceRecord {
    id: EvidenceId,
    purpose: EvidencePurpose,
    image: ImageBlob,
    reading: Option<Reading>,
    location: Option<LatLon>,
    captured_at: UnixTimeMs,
}

impl EvidenceRecord {
    #[must_use]
    pub fn from_parts(
        purpose: EvidencePurpose,
        image: ImageBlob,
        reading: Option<Reading>,
        location: Option<LatLon>,
        captured_at: UnixTimeMs,
    ) -> Self {
        Self {
            id: EvidenceId::generate(),
            purpose,
            image,
            reading,
            location,
            captured_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> &EvidenceId {
        &self.id
    }

    #[must_use]
    pub fn purpose(&self) -> EvidencePurpose {
        self.purpose
    }

    #[must_use]
    pub fn image(&self) -> &ImageBlob {
        &self.image
    }

    #[must_use]
    pub fn reading(&self) -> Option<&Reading> {
        self.reading.as_ref()
    }

    #[must_use]
    pub fn location(&self) -> Option<LatLon> {
        self.location
    }

    #[must_use]
    pub fn captured_at(&self) -> UnixTimeMs {
        self.captured_at
    }
}

/// Collects one record while the dialog is open.
///
/// The camera and the one-shot location query start together; whatever the
/// location query has produced by `finalize` goes into the record.
pub struct EvidenceBuilder {
    purpose: EvidencePurpose,
    requirement: ReadingRequirement,
    capture: MediaCaptureSession,
    probe: Arc<LocationProbe>,
    reading: Option<Reading>,
    location: Option<JoinHandle<Option<LatLon>>>,
    captured_at: Option<UnixTimeMs>,
    closed: bool,
    cancelled: bool,
}

impl EvidenceBuilder {
    #[instrument(skip_all, fields(purpose = %purpose))]
    pub async fn open(
        camera: Arc<dyn CameraDevice>,
        probe: Arc<LocationProbe>,
        config: &CaptureConfig,
        purpose: EvidencePurpose,
        requirement: ReadingRequirement,
    ) -> Result<Self, EvidenceError> {
        let location = spawn_location(&probe);

        let mut capture = MediaCaptureSession::new(camera, config);
        if let Err(e) = capture.open(config.default_facing).await {
            location.abort();
            return Err(e.into());
        }

        Ok(Self {
            purpose,
            requirement,
            capture,
            probe,
            reading: None,
            location: Some(location),
            captured_at: None,
            closed: false,
            cancelled: false,
        })
    }

    /// Reopens a finalized builder for a new photo, keeping the reading.
    /// A cancelled builder stays closed.
    pub async fn reopen(&mut self) -> Result<(), EvidenceError> {
        if self.cancelled {
            return Err(EvidenceError::Closed);
        }
        if !self.closed {
            return self.recapture().await;
        }

        self.capture.open(self.capture.facing()).await?;
        if let Some(stale) = self.location.replace(spawn_location(&self.probe)) {
            stale.abort();
        }
        self.captured_at = None;
        self.closed = false;
        debug!(purpose = %self.purpose, "evidence builder reopened");
        Ok(())
    }

    #[must_use]
    pub fn requirement(&self) -> ReadingRequirement {
        self.requirement
    }

    #[must_use]
    pub fn purpose(&self) -> EvidencePurpose {
        self.purpose
    }

    #[must_use]
    pub fn capture_session(&self) -> &MediaCaptureSession {
        &self.capture
    }

    #[must_use]
    pub fn image(&self) -> Option<&ImageBlob> {
        self.capture.captured()
    }

    #[must_use]
    pub fn reading(&self) -> Option<&Reading> {
        self.reading.as_ref()
    }

    pub async fn capture(&mut self) -> Result<ImageBlob, EvidenceError> {
        self.ensure_open()?;
        let image = self.capture.capture_frame().await?;
        self.captured_at = Some(UnixTimeMs::now());
        Ok(image)
    }

    pub async fn recapture(&mut self) -> Result<(), EvidenceError> {
        self.ensure_open()?;
        self.captured_at = None;
        Ok(self.capture.recapture().await?)
    }

    pub async fn toggle_facing(&mut self) -> Result<CameraFacing, EvidenceError> {
        self.ensure_open()?;
        Ok(self.capture.toggle_facing().await?)
    }

    pub fn set_reading(&mut self, input: &str) -> Result<(), EvidenceError> {
        self.ensure_open()?;
        self.reading = Reading::parse(input)?;
        Ok(())
    }

    /// Rebuilds a finalized record with a corrected reading. Photo, location
    /// and capture time carry over; the record gets a new id.
    pub fn amend_reading(
        &mut self,
        record: &EvidenceRecord,
        input: &str,
    ) -> Result<EvidenceRecord, EvidenceError> {
        if self.cancelled {
            return Err(EvidenceError::Closed);
        }
        let reading = Reading::parse(input)?;
        if reading.is_none() && self.requirement == ReadingRequirement::Required {
            return Err(EvidenceError::MissingReading {
                purpose: self.purpose,
            });
        }
        self.reading.clone_from(&reading);
        Ok(EvidenceRecord::from_parts(
            record.purpose(),
            record.image().clone(),
            reading,
            record.location(),
            record.captured_at(),
        ))
    }

    /// First thing still missing before the record can be built.
    #[must_use]
    pub fn missing(&self) -> Option<EvidenceError> {
        if self.closed {
            return Some(EvidenceError::Closed);
        }
        if self.capture.captured().is_none() {
            return Some(EvidenceError::MissingImage);
        }
        if self.requirement == ReadingRequirement::Required && self.reading.is_none() {
            return Some(EvidenceError::MissingReading {
                purpose: self.purpose,
            });
        }
        None
    }

    #[must_use]
    pub fn can_finalize(&self) -> bool {
        self.missing().is_none()
    }

    /// Closes the camera and snapshots the location. The builder is spent afterwards.
    pub async fn finalize(&mut self) -> Result<EvidenceRecord, EvidenceError> {
        if let Some(missing) = self.missing() {
            return Err(missing);
        }

        // Give a location answer that is already in hand a chance to land.
        tokio::task::yield_now().await;
        let location = self.snapshot_location().await;

        let image = self
            .capture
            .take_captured()
            .ok_or(EvidenceError::MissingImage)?;
        self.capture.close();
        self.closed = true;

        debug!(purpose = %self.purpose, has_location = location.is_some(), "evidence finalized");
        Ok(EvidenceRecord::from_parts(
            self.purpose,
            image,
            self.reading.clone(),
            location,
            self.captured_at.unwrap_or_else(UnixTimeMs::now),
        ))
    }

    /// Releases the camera and abandons the location query.
    pub fn cancel(&mut self) {
        self.capture.close();
        if let Some(handle) = self.location.take() {
            handle.abort();
        }
        self.reading = None;
        self.closed = true;
        self.cancelled = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn snapshot_location(&mut self) -> Option<LatLon> {
        let handle = self.location.take()?;
        if handle.is_finished() {
            handle.await.ok().flatten()
        } else {
            handle.abort();
            None
        }
    }

    fn ensure_open(&self) -> Result<(), EvidenceError> {
        if self.closed {
            Err(EvidenceError::Closed)
        } else {
            Ok(())
        }
    }
}

fn spawn_location(probe: &Arc<LocationProbe>) -> JoinHandle<Option<LatLon>> {
    let probe = Arc::clone(probe);
    tokio::spawn(async move { probe.get_once().await })
}

impl Drop for EvidenceBuilder {
    fn drop(&mut self) {
        self.cancel();
    }
}
