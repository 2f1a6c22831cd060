use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable interleaved pixel data - can be shared across destinations without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support, all 3 bytes per pixel, row-major
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        3
    }
}

impl Frame {
    /// Wrap raw interleaved pixels; returns `None` when the buffer size does not match
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Option<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 || data.len() != expected {
            return None;
        }

        Some(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format: PixelFormat::Rgb24,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    /// Exclusive RGB working copy for the transform pipeline
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut raw = self.data.to_vec();
        if self.meta.format == PixelFormat::Bgr24 {
            for px in raw.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }
        // Length is validated on construction
        RgbImage::from_raw(self.meta.width, self.meta.height, raw)
            .unwrap_or_else(|| RgbImage::new(self.meta.width, self.meta.height))
    }

    /// Same pixels, restamped with a new sequence number
    pub fn with_sequence(&self, sequence: u64) -> Self {
        let mut meta = (*self.meta).clone();
        meta.sequence = sequence;
        Self {
            data: self.data.clone(),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}
