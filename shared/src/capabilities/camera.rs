use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::{AppError, ErrorKind, DEFAULT_STREAM_READY_TIMEOUT, MAX_IMAGE_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    Front,
    #[default]
    Back,
}

impl CameraFacing {
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }

    /// `facingMode` constraint understood by web shells.
    #[must_use]
    pub const fn facing_mode(self) -> &'static str {
        match self {
            CameraFacing::Front => "user",
            CameraFacing::Back => "environment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    #[must_use]
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }

        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(ImageFormat::Png);
        }

        None
    }
}

/// One still frame handed over by the shell.
///
/// Web and native shells either rasterize the live video into RGBA pixels
/// (the canvas path) or hand back an already-encoded photo (the file-picker path).
#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    Rgba {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    Encoded(Vec<u8>),
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Rgba { width, height, pixels } => f
                .debug_struct("Rgba")
                .field("width", width)
                .field("height", height)
                .field("bytes", &pixels.len())
                .finish(),
            Frame::Encoded(data) => f.debug_tuple("Encoded").field(&data.len()).finish(),
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("camera unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("camera {facing:?} not available on this device")]
    CameraNotFound { facing: CameraFacing },

    #[error("camera stream produced no frame within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("capture failed: {reason}")]
    CaptureFailed { reason: String },

    #[error("image too large: {size} bytes exceeds maximum of {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("camera is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
}

impl CameraError {
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, CameraError::PermissionDenied)
    }

    /// Whether the dialog should offer "try again" rather than only "cancel".
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CameraError::PermissionDenied
                | CameraError::DeviceUnavailable { .. }
                | CameraError::CameraNotFound { .. }
                | CameraError::Timeout { .. }
                | CameraError::CaptureFailed { .. }
        )
    }
}

impl From<CameraError> for AppError {
    fn from(e: CameraError) -> Self {
        let kind = match &e {
            CameraError::PermissionDenied => ErrorKind::CameraPermissionDenied,
            CameraError::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            CameraError::InvalidImage { .. } => ErrorKind::ImageProcessing,
            CameraError::InvalidState { .. } => ErrorKind::InvalidState,
            CameraError::DeviceUnavailable { .. }
            | CameraError::CameraNotFound { .. }
            | CameraError::Timeout { .. }
            | CameraError::CaptureFailed { .. } => ErrorKind::Camera,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub default_facing: CameraFacing,
    pub ready_timeout_ms: u64,
    pub max_image_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_facing: CameraFacing::Back,
            ready_timeout_ms: u64::try_from(DEFAULT_STREAM_READY_TIMEOUT.as_millis())
                .unwrap_or(10_000),
            max_image_bytes: MAX_IMAGE_BYTES,
        }
    }
}

impl CaptureConfig {
    #[must_use]
    pub fn with_facing(mut self, facing: CameraFacing) -> Self {
        self.default_facing = facing;
        self
    }

    #[must_use]
    pub fn with_ready_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ready_timeout_ms = timeout_ms.clamp(100, 120_000);
        self
    }

    #[must_use]
    pub fn with_max_image_bytes(mut self, max_bytes: usize) -> Self {
        self.max_image_bytes = max_bytes.min(MAX_IMAGE_BYTES);
        self
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// A live camera feed. Dropping it without `stop` leaks the hardware, so
/// streams are only ever held through the capture session's guard.
#[async_trait]
pub trait VideoStream: Send {
    fn facing(&self) -> CameraFacing;

    /// Resolves once the stream has produced its first frame.
    async fn ready(&mut self) -> Result<(), CameraError>;

    fn grab_frame(&mut self) -> Result<Frame, CameraError>;

    /// Stops every underlying track.
    fn stop(&mut self);
}

#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn open(&self, facing: CameraFacing) -> Result<Box<dyn VideoStream>, CameraError>;
}
