use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use threat_hud_common::config::CameraConfig;
use threat_hud_common::frame::Frame;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{decode_into, jpeg_dimensions, CaptureDevice, DeviceError, DeviceHandle};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` JPEG streams.
pub struct MjpegParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MjpegParser {
    pub fn new(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        Self {
            boundary: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one chunk from the wire; returns every JPEG completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let marker_len = self.boundary.len();
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + marker_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > marker_len {
                            let _ = self.buffer.split_to(self.buffer.len() - marker_len);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        // Don't rescan what we've already searched
                        self.jpeg_start = self.buffer.len().saturating_sub(marker_len);
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let mut part = self.buffer.split_to(jpeg_end + marker_len);
                    part.truncate(end);
                    if !part.is_empty() {
                        frames.push(part.freeze());
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }
}

/// Extract the boundary parameter from a multipart content type.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Camera served as a continuous MJPEG stream over HTTP.
pub struct MjpegCamera {
    client: reqwest::Client,
    url: String,
}

impl MjpegCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

impl CaptureDevice for MjpegCamera {
    type Handle = MjpegHandle;

    async fn acquire(&mut self) -> Result<MjpegHandle, DeviceError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(DeviceError::PermissionDenied(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DeviceError::Unavailable(format!("HTTP {status}")));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
        info!(%status, boundary, "connected to MJPEG stream");

        let shared = Arc::new(Mutex::new(StreamState::default()));
        let reader = tokio::spawn(read_stream(response, boundary, Arc::clone(&shared)));
        Ok(MjpegHandle { shared, reader })
    }
}

#[derive(Default)]
struct StreamState {
    latest: Option<Bytes>,
    dimensions: Option<(u32, u32)>,
    frames_seen: u64,
    ended: bool,
}

/// Keeps only the newest JPEG; older ones are overwritten unread.
async fn read_stream(response: reqwest::Response, boundary: String, shared: Arc<Mutex<StreamState>>) {
    let mut parser = MjpegParser::new(&boundary);
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "MJPEG stream error");
                break;
            }
        };
        for jpeg in parser.push(&chunk) {
            let dims = jpeg_dimensions(&jpeg);
            let Ok(mut state) = shared.lock() else {
                return;
            };
            if dims.is_some() && dims != state.dimensions {
                debug!(?dims, "MJPEG stream dimensions changed");
                state.dimensions = dims;
            }
            state.latest = Some(jpeg);
            state.frames_seen += 1;
        }
    }

    if let Ok(mut state) = shared.lock() {
        info!(frames = state.frames_seen, "MJPEG stream ended");
        state.ended = true;
    }
}

pub struct MjpegHandle {
    shared: Arc<Mutex<StreamState>>,
    reader: JoinHandle<()>,
}

impl DeviceHandle for MjpegHandle {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.shared.lock().ok().and_then(|s| s.dimensions)
    }

    fn is_ready(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.latest.is_some())
            .unwrap_or(false)
    }

    fn is_disconnected(&self) -> bool {
        self.shared.lock().map(|s| s.ended).unwrap_or(true)
    }

    async fn capture_frame(&mut self, frame: &mut Frame) -> Result<(), DeviceError> {
        let jpeg = {
            let state = self.shared.lock().map_err(|_| DeviceError::Disconnected)?;
            if state.ended {
                return Err(DeviceError::Disconnected);
            }
            state
                .latest
                .clone()
                .ok_or_else(|| DeviceError::BadFrame("no frame buffered".into()))?
        };
        decode_into(&jpeg, frame)
    }

    async fn release(self) {
        self.reader.abort();
        let _ = self.reader.await;
        let frames = self.shared.lock().map(|s| s.frames_seen).unwrap_or(0);
        debug!(frames, "MJPEG stream released");
    }
}
