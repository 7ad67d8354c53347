#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod backend;
pub mod capabilities;
pub mod capture;
pub mod config;
pub mod evidence;
pub mod fuel;
pub mod location;
pub mod model;
pub mod session;
pub mod submission;
pub mod telemetry;
pub mod trip;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use backend::TripBackend;
pub use capabilities::{CameraDevice, CameraError, CameraFacing, Geolocator, RestBackend};
pub use capture::{CaptureState, ImageBlob, MediaCaptureSession};
pub use config::CoreConfig;
pub use evidence::{EvidenceBuilder, EvidencePurpose, EvidenceRecord, Reading};
pub use fuel::FuelWorkflow;
pub use location::LocationProbe;
pub use model::{DriverIdentity, FuelAllocation, LatLon, Trip, TripId, TripStatus};
pub use session::{CaptureDialog, DriverSession};
pub use submission::{SubmissionCoordinator, SubmissionError, SubmissionOutcome};
pub use trip::{TripError, TripEvent, TripStateMachine};

pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_LOCATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const FUEL_CONFIRMATION_DELAY: Duration = Duration::from_secs(3);
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const ACKNOWLEDGED_EVIDENCE_CACHE: usize = 256;
pub const MAX_READING_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Deserialization,
    ImageProcessing,
    ImageTooLarge,
    Camera,
    CameraPermissionDenied,
    Location,
    LocationPermissionDenied,
    Configuration,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::Camera => "CAMERA_ERROR",
            Self::CameraPermissionDenied => "CAMERA_PERMISSION_DENIED",
            Self::Location => "LOCATION_ERROR",
            Self::LocationPermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Camera
            | Self::Location
            | Self::Internal => ErrorSeverity::Transient,

            Self::Configuration | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Deserialization
            | Self::ImageProcessing
            | Self::ImageTooLarge
            | Self::CameraPermissionDenied
            | Self::LocationPermissionDenied
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::Conflict
                | Self::Camera
                | Self::Location
                | Self::Internal
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            retry_after_ms: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    /// Text shown in the capture dialog next to the retry/cancel choice.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to reach the server. Check your connection and submit again.".into()
            }
            ErrorKind::Timeout => "The server took too long to answer. Please submit again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => "You are not allowed to update this trip.".into(),
            ErrorKind::Validation | ErrorKind::Conflict => self.message.clone(),
            ErrorKind::NotFound => "This trip could not be found on the server.".into(),
            ErrorKind::RateLimited => match self.retry_after_ms {
                Some(ms) => format!(
                    "Too many requests. Please wait {} seconds and try again.",
                    ms / 1000
                ),
                None => "Too many requests. Please wait a moment and try again.".into(),
            },
            ErrorKind::Deserialization => {
                "The server sent an unexpected answer. Please try again.".into()
            }
            ErrorKind::ImageProcessing => {
                "Unable to process the photo. Please recapture the odometer.".into()
            }
            ErrorKind::ImageTooLarge => format!(
                "The photo is too large. The limit is {} MB.",
                MAX_IMAGE_BYTES / (1024 * 1024)
            ),
            ErrorKind::Camera => "Camera error. Please close and reopen the camera.".into(),
            ErrorKind::CameraPermissionDenied => {
                "Camera access is required to photograph the odometer. Enable it in Settings."
                    .into()
            }
            ErrorKind::Location => "Unable to determine your location.".into(),
            ErrorKind::LocationPermissionDenied => {
                "Location access is off. The reading will be sent without a position.".into()
            }
            ErrorKind::Configuration => "The app is misconfigured. Please contact support.".into(),
            ErrorKind::InvalidState => {
                "This action is not available for the trip right now.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }

    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        self.context.get("http_status").and_then(|s| s.parse().ok())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::new(ErrorKind::Deserialization, "malformed response body")
            .with_internal(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;
