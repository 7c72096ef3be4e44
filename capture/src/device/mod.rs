pub mod mjpeg;
pub mod snapshot;

use std::future::Future;
use std::io::Cursor;

use chrono::Utc;
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};
use threat_hud_common::config::CameraConfig;
use threat_hud_common::frame::Frame;
use threat_hud_common::state::ErrorKind;

pub use mjpeg::{MjpegCamera, MjpegHandle};
pub use snapshot::{SnapshotCamera, SnapshotHandle};

/// Source of video capture handles.
///
/// The capture loop calls [`CaptureDevice::acquire`] once per start and never
/// retries on its own; a failed acquire leaves the HUD offline until the
/// operator asks again.
pub trait CaptureDevice: Send + 'static {
    type Handle: DeviceHandle;

    fn acquire(&mut self) -> impl Future<Output = Result<Self::Handle, DeviceError>> + Send;
}

/// An open capture stream. Owned by exactly one capture session.
pub trait DeviceHandle: Send + 'static {
    /// Current stream dimensions, or `None` if the device has not reported any yet.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Whether enough data is buffered to take a frame.
    fn is_ready(&self) -> bool;

    /// Whether the device went away. Checked before readiness, so a stream
    /// that dies before reporting dimensions still ends the session.
    fn is_disconnected(&self) -> bool;

    /// Write the current picture into `frame`, which the caller has already
    /// sized to [`DeviceHandle::dimensions`].
    fn capture_frame(
        &mut self,
        frame: &mut Frame,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn release(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture device permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device disconnected")]
    Disconnected,
    #[error("unusable frame: {0}")]
    BadFrame(String),
    #[error("unknown camera mode {0:?}, expected 'mjpeg' or 'snapshot'")]
    UnknownMode(String),
}

impl DeviceError {
    /// Errors that end the capture session. Everything else skips one tick.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DeviceError::BadFrame(_))
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.is_fatal().then_some(ErrorKind::DeviceUnavailable)
    }
}

/// Camera backend selected by `camera.mode`.
pub enum Camera {
    Mjpeg(MjpegCamera),
    Snapshot(SnapshotCamera),
}

pub enum CameraHandle {
    Mjpeg(MjpegHandle),
    Snapshot(SnapshotHandle),
}

impl Camera {
    pub fn from_config(config: &CameraConfig) -> Result<Self, DeviceError> {
        match config.mode.as_str() {
            "mjpeg" => Ok(Camera::Mjpeg(MjpegCamera::new(config)?)),
            "snapshot" => Ok(Camera::Snapshot(SnapshotCamera::new(config)?)),
            other => Err(DeviceError::UnknownMode(other.to_string())),
        }
    }
}

impl CaptureDevice for Camera {
    type Handle = CameraHandle;

    async fn acquire(&mut self) -> Result<CameraHandle, DeviceError> {
        match self {
            Camera::Mjpeg(cam) => cam.acquire().await.map(CameraHandle::Mjpeg),
            Camera::Snapshot(cam) => cam.acquire().await.map(CameraHandle::Snapshot),
        }
    }
}

impl DeviceHandle for CameraHandle {
    fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            CameraHandle::Mjpeg(h) => h.dimensions(),
            CameraHandle::Snapshot(h) => h.dimensions(),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            CameraHandle::Mjpeg(h) => h.is_ready(),
            CameraHandle::Snapshot(h) => h.is_ready(),
        }
    }

    fn is_disconnected(&self) -> bool {
        match self {
            CameraHandle::Mjpeg(h) => h.is_disconnected(),
            CameraHandle::Snapshot(h) => h.is_disconnected(),
        }
    }

    async fn capture_frame(&mut self, frame: &mut Frame) -> Result<(), DeviceError> {
        match self {
            CameraHandle::Mjpeg(h) => h.capture_frame(frame).await,
            CameraHandle::Snapshot(h) => h.capture_frame(frame).await,
        }
    }

    async fn release(self) {
        match self {
            CameraHandle::Mjpeg(h) => h.release().await,
            CameraHandle::Snapshot(h) => h.release().await,
        }
    }
}

/// Read width and height from a JPEG header without decoding pixels.
pub(crate) fn jpeg_dimensions(jpeg: &[u8]) -> Option<(u32, u32)> {
    ImageReader::with_format(Cursor::new(jpeg), ImageFormat::Jpeg)
        .into_dimensions()
        .ok()
}

/// Decode `jpeg` into `frame`. A picture whose size differs from the buffer
/// is scaled to fit it.
pub(crate) fn decode_into(jpeg: &[u8], frame: &mut Frame) -> Result<(), DeviceError> {
    let rgb = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map_err(|e| DeviceError::BadFrame(e.to_string()))?
        .to_rgb8();

    let (width, height) = frame.dimensions();
    if rgb.dimensions() == (width, height) {
        frame.pixels_mut().copy_from_slice(rgb.as_raw());
    } else {
        let scaled = image::imageops::resize(&rgb, width, height, FilterType::Triangle);
        frame.pixels_mut().copy_from_slice(scaled.as_raw());
    }
    frame.captured_at_ms = Utc::now().timestamp_millis();
    Ok(())
}
