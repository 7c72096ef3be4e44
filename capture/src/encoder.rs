use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use threat_hud_common::frame::{EncodedImage, Frame};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("cannot encode an empty frame")]
    EmptyFrame,
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Lossy frame compressor with a fixed quality factor.
pub struct FrameEncoder {
    quality: u8,
    /// Size of the previous output, used to pre-size the next buffer.
    last_len: usize,
}

impl FrameEncoder {
    /// `quality` is on the 1..=100 JPEG scale.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            last_len: 0,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&mut self, frame: &Frame) -> Result<EncodedImage, EncodeError> {
        if frame.is_empty() {
            return Err(EncodeError::EmptyFrame);
        }
        let (width, height) = frame.dimensions();
        let mut jpeg = Vec::with_capacity(self.last_len);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            frame.pixels().as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;
        self.last_len = jpeg.len();

        debug!(width, height, quality = self.quality, bytes = jpeg.len(), "frame encoded");
        Ok(EncodedImage {
            jpeg,
            quality: self.quality,
            width,
            height,
            captured_at_ms: frame.captured_at_ms,
        })
    }
}
