//! Shell-facing seams: camera, geolocation and the REST transport.

mod camera;
mod geolocation;
mod http;

pub use self::camera::{
    CameraDevice, CameraError, CameraFacing, CaptureConfig, Frame, ImageFormat, VideoStream,
};
pub use self::geolocation::{GeolocationError, Geolocator, Position, PositionOptions};
pub use self::http::{HttpError, RestBackend, ValidatedUrl};
