//! Camera stream ownership and still-frame capture for the odometer dialog.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use image::ImageEncoder;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capabilities::{
    CameraDevice, CameraError, CameraFacing, CaptureConfig, Frame, ImageFormat, VideoStream,
};

/// Encoded still image ready for transport.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBlob {
    data: Bytes,
    format: ImageFormat,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBlob")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl ImageBlob {
    #[must_use]
    pub fn from_parts(data: Bytes, format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            data,
            format,
            width,
            height,
        }
    }

    /// Encodes raw pixels as PNG, or validates an already-encoded photo.
    pub fn from_frame(frame: Frame, max_bytes: usize) -> Result<Self, CameraError> {
        let blob = match frame {
            Frame::Rgba {
                width,
                height,
                pixels,
            } => encode_png(width, height, &pixels)?,
            Frame::Encoded(data) => {
                check_size(data.len(), max_bytes)?;
                let format =
                    ImageFormat::from_magic_bytes(&data).ok_or_else(|| CameraError::InvalidImage {
                        reason: "unrecognized image format".to_string(),
                    })?;
                let decoded = image::load_from_memory_with_format(&data, codec_format(format))
                    .map_err(|e| CameraError::InvalidImage {
                        reason: e.to_string(),
                    })?;
                Self::from_parts(Bytes::from(data), format, decoded.width(), decoded.height())
            }
        };

        check_size(blob.data.len(), max_bytes)?;
        Ok(blob)
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            STANDARD.encode(&self.data)
        )
    }

    /// Name of the multipart file part, e.g. `odometer.png`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("odometer.{}", self.format.extension())
    }
}

fn codec_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
    }
}

fn check_size(size: usize, max: usize) -> Result<(), CameraError> {
    if size > max {
        return Err(CameraError::ImageTooLarge { size, max });
    }
    Ok(())
}

fn encode_png(width: u32, height: u32, pixels: &[u8]) -> Result<ImageBlob, CameraError> {
    if width == 0 || height == 0 {
        return Err(CameraError::InvalidImage {
            reason: "frame has no pixels".to_string(),
        });
    }
    let expected = u64::from(width) * u64::from(height) * 4;
    if pixels.len() as u64 != expected {
        return Err(CameraError::InvalidImage {
            reason: format!(
                "frame is {width}x{height} but carries {} bytes, expected {expected}",
                pixels.len()
            ),
        });
    }

    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(pixels, width, height, image::ExtendedColorType::Rgba8)
        .map_err(|e| CameraError::CaptureFailed {
            reason: e.to_string(),
        })?;

    Ok(ImageBlob::from_parts(
        Bytes::from(out),
        ImageFormat::Png,
        width,
        height,
    ))
}

/// Sole owner of a live stream. Stops the hardware exactly once.
struct StreamGuard {
    stream: Option<Box<dyn VideoStream>>,
}

impl StreamGuard {
    fn new(stream: Box<dyn VideoStream>) -> Self {
        counter!("capture.streams_opened").increment(1);
        Self {
            stream: Some(stream),
        }
    }

    fn stream_mut(&mut self) -> Option<&mut (dyn VideoStream + 'static)> {
        self.stream.as_deref_mut()
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            counter!("capture.streams_released").increment(1);
            debug!(facing = ?stream.facing(), "camera stream released");
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    Opening,
    Streaming,
    Captured,
    Closed,
}

impl CaptureState {
    fn name(self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Opening => "opening",
            CaptureState::Streaming => "streaming",
            CaptureState::Captured => "captured",
            CaptureState::Closed => "closed",
        }
    }
}

/// One camera dialog's worth of capture: at most one live stream, at most one
/// captured image.
pub struct MediaCaptureSession {
    camera: Arc<dyn CameraDevice>,
    config: CaptureConfig,
    facing: CameraFacing,
    state: CaptureState,
    stream: Option<StreamGuard>,
    captured: Option<ImageBlob>,
}

impl MediaCaptureSession {
    #[must_use]
    pub fn new(camera: Arc<dyn CameraDevice>, config: &CaptureConfig) -> Self {
        Self {
            camera,
            facing: config.default_facing,
            config: config.clone(),
            state: CaptureState::Idle,
            stream: None,
            captured: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    #[must_use]
    pub fn facing(&self) -> CameraFacing {
        self.facing
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(|g| g.stream.is_some())
    }

    #[must_use]
    pub fn captured(&self) -> Option<&ImageBlob> {
        self.captured.as_ref()
    }

    pub fn take_captured(&mut self) -> Option<ImageBlob> {
        self.captured.take()
    }

    /// Opens the camera, releasing any stream this session still holds first.
    pub async fn open(&mut self, facing: CameraFacing) -> Result<(), CameraError> {
        self.release_stream();
        self.captured = None;
        self.facing = facing;
        self.state = CaptureState::Opening;

        match self.camera.open(facing).await {
            Ok(stream) => {
                self.stream = Some(StreamGuard::new(stream));
                self.state = CaptureState::Streaming;
                info!(facing = facing.facing_mode(), "camera stream opened");
                Ok(())
            }
            Err(e) => {
                self.state = CaptureState::Idle;
                warn!(facing = facing.facing_mode(), error = %e, "camera open failed");
                Err(e)
            }
        }
    }

    /// Grabs one frame once the stream is ready and releases the camera.
    pub async fn capture_frame(&mut self) -> Result<ImageBlob, CameraError> {
        let timeout = self.config.ready_timeout();
        let state = self.state;
        let stream = self
            .stream
            .as_mut()
            .and_then(StreamGuard::stream_mut)
            .filter(|_| state == CaptureState::Streaming)
            .ok_or(CameraError::InvalidState {
                state: state.name(),
                operation: "capture",
            })?;

        match tokio::time::timeout(timeout, stream.ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                return Err(CameraError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
        let frame = stream.grab_frame()?;

        self.release_stream();
        match ImageBlob::from_frame(frame, self.config.max_image_bytes) {
            Ok(blob) => {
                debug!(bytes = blob.len(), format = ?blob.format(), "frame captured");
                self.captured = Some(blob.clone());
                self.state = CaptureState::Captured;
                Ok(blob)
            }
            Err(e) => {
                self.state = CaptureState::Idle;
                Err(e)
            }
        }
    }

    /// Switches front/back. The old stream is stopped before the new one opens.
    pub async fn toggle_facing(&mut self) -> Result<CameraFacing, CameraError> {
        if !matches!(self.state, CaptureState::Streaming | CaptureState::Idle) {
            return Err(CameraError::InvalidState {
                state: self.state.name(),
                operation: "toggle facing",
            });
        }

        let previous = self.facing;
        let next = previous.toggled();
        if let Err(e) = self.open(next).await {
            self.facing = previous;
            return Err(e);
        }
        Ok(next)
    }

    /// Discards the captured image and reopens the camera.
    pub async fn recapture(&mut self) -> Result<(), CameraError> {
        if !matches!(self.state, CaptureState::Captured | CaptureState::Idle) {
            return Err(CameraError::InvalidState {
                state: self.state.name(),
                operation: "recapture",
            });
        }
        self.open(self.facing).await
    }

    /// Stops the stream and drops any captured image. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.release_stream();
        self.captured = None;
        self.state = CaptureState::Closed;
    }

    fn release_stream(&mut self) {
        if let Some(mut guard) = self.stream.take() {
            guard.release();
        }
    }
}

impl std::fmt::Debug for MediaCaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCaptureSession")
            .field("state", &self.state)
            .field("facing", &self.facing)
            .field("streaming", &self.is_streaming())
            .finish_non_exhaustive()
    }
}
