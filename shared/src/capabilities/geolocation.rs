use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::LatLon;
use crate::{AppError, ErrorKind, DEFAULT_LOCATION_TIMEOUT};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {reason}")]
    PositionUnavailable { reason: String },

    #[error("no position within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("geolocation is not supported on this device")]
    Unsupported,
}

impl From<GeolocationError> for AppError {
    fn from(e: GeolocationError) -> Self {
        let kind = match e {
            GeolocationError::PermissionDenied => ErrorKind::LocationPermissionDenied,
            GeolocationError::Timeout { .. } => ErrorKind::Timeout,
            GeolocationError::PositionUnavailable { .. } | GeolocationError::Unsupported => {
                ErrorKind::Location
            }
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: DEFAULT_LOCATION_TIMEOUT,
            maximum_age: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coords: LatLon,
    pub accuracy_m: Option<f64>,
}

/// Device location provider implemented by the shell.
///
/// Implementations should honour `options.timeout` themselves; the probe also
/// bounds every call so a provider that never answers cannot stall a dialog.
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self, options: PositionOptions)
        -> Result<Position, GeolocationError>;
}
