use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbImage;

const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// A decoded RGB snapshot taken from a live device handle.
///
/// The capture loop keeps one of these as a scratch buffer and resizes it to
/// the device's reported dimensions before every capture, so a camera that
/// changes resolution mid-session is tracked tick by tick.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: RgbImage,
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbImage::new(width, height),
            captured_at_ms: 0,
        }
    }

    pub fn from_image(pixels: RgbImage, captured_at_ms: i64) -> Self {
        Self {
            pixels,
            captured_at_ms,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.width() == 0 || self.pixels.height() == 0
    }

    /// Resize the backing buffer. Contents are undefined until the next capture.
    /// Returns `true` if the dimensions changed.
    pub fn resize_to(&mut self, width: u32, height: u32) -> bool {
        if self.pixels.dimensions() == (width, height) {
            return false;
        }
        self.pixels = RgbImage::new(width, height);
        true
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut RgbImage {
        &mut self.pixels
    }
}

/// A lossy-compressed frame ready to be sent to the classification backend.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub jpeg: Vec<u8>,
    /// JPEG quality (1..=100) the payload was encoded with.
    pub quality: u8,
    pub width: u32,
    pub height: u32,
    pub captured_at_ms: i64,
}

impl EncodedImage {
    /// Render as a `data:image/jpeg;base64,...` URI, the form the backend expects.
    pub fn to_data_uri(&self) -> String {
        let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + self.jpeg.len() * 4 / 3 + 4);
        uri.push_str(DATA_URI_PREFIX);
        STANDARD.encode_string(&self.jpeg, &mut uri);
        uri
    }

    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }
}
