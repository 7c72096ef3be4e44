use bytes::Bytes;
use std::time::Duration;
use threat_hud_common::config::CameraConfig;
use threat_hud_common::frame::Frame;
use tracing::{debug, info};

use super::{decode_into, jpeg_dimensions, CaptureDevice, DeviceError, DeviceHandle};

/// Camera that serves one JPEG per HTTP GET.
pub struct SnapshotCamera {
    client: reqwest::Client,
    url: String,
}

impl SnapshotCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Bytes, DeviceError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|_| DeviceError::Disconnected)?;
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DeviceError::PermissionDenied(format!("HTTP {status}")));
    }
    if !status.is_success() {
        return Err(DeviceError::BadFrame(format!("HTTP {status}")));
    }
    resp.bytes().await.map_err(|_| DeviceError::Disconnected)
}

impl CaptureDevice for SnapshotCamera {
    type Handle = SnapshotHandle;

    async fn acquire(&mut self) -> Result<SnapshotHandle, DeviceError> {
        info!(url = self.url, "probing snapshot camera");
        let first = fetch(&self.client, &self.url).await.map_err(|e| match e {
            DeviceError::Disconnected | DeviceError::BadFrame(_) => {
                DeviceError::Unavailable(e.to_string())
            }
            other => other,
        })?;
        let dimensions = jpeg_dimensions(&first)
            .ok_or_else(|| DeviceError::Unavailable("camera did not return a JPEG".into()))?;
        info!(?dimensions, "snapshot camera ready");

        Ok(SnapshotHandle {
            client: self.client.clone(),
            url: self.url.clone(),
            dimensions: Some(dimensions),
            pending: Some(first),
        })
    }
}

pub struct SnapshotHandle {
    client: reqwest::Client,
    url: String,
    dimensions: Option<(u32, u32)>,
    /// The probe frame, used for the first capture.
    pending: Option<Bytes>,
}

impl DeviceHandle for SnapshotHandle {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    fn is_ready(&self) -> bool {
        self.dimensions.is_some()
    }

    /// Each capture is its own request, so loss shows up as a failed fetch.
    fn is_disconnected(&self) -> bool {
        false
    }

    async fn capture_frame(&mut self, frame: &mut Frame) -> Result<(), DeviceError> {
        let jpeg = match self.pending.take() {
            Some(jpeg) => jpeg,
            None => fetch(&self.client, &self.url).await?,
        };
        let dims = jpeg_dimensions(&jpeg)
            .ok_or_else(|| DeviceError::BadFrame("not a JPEG image".into()))?;
        if Some(dims) != self.dimensions {
            debug!(?dims, "snapshot camera dimensions changed");
            self.dimensions = Some(dims);
        }
        // The caller sized the buffer from the previous response.
        frame.resize_to(dims.0, dims.1);
        decode_into(&jpeg, frame)
    }

    async fn release(self) {
        debug!(url = self.url, "snapshot camera released");
    }
}
