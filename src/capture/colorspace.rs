//! Per-frame colorspace conversion applied on the capture thread

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorConversion {
    BgrToRgb,
    RgbToBgr,
    /// Rec. 601 luma replicated into all three channels
    Grayscale,
}

impl ColorConversion {
    pub fn apply(self, frame: &Frame) -> Result<Frame, CaptureError> {
        let (data, format) = match self {
            Self::BgrToRgb => (swap_red_blue(frame, PixelFormat::Bgr24)?, PixelFormat::Rgb24),
            Self::RgbToBgr => (swap_red_blue(frame, PixelFormat::Rgb24)?, PixelFormat::Bgr24),
            Self::Grayscale => (grayscale(frame), frame.meta.format),
        };

        Ok(Frame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                format,
                ..(*frame.meta).clone()
            }),
            timestamp: frame.timestamp,
        })
    }
}

fn swap_red_blue(frame: &Frame, expected: PixelFormat) -> Result<Vec<u8>, CaptureError> {
    if frame.meta.format != expected {
        return Err(CaptureError::Conversion(format!(
            "{:?} conversion needs a {:?} frame, got {:?}",
            expected, expected, frame.meta.format
        )));
    }

    let mut data = frame.data.to_vec();
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Ok(data)
}

fn grayscale(frame: &Frame) -> Vec<u8> {
    let (r, b) = match frame.meta.format {
        PixelFormat::Rgb24 => (0, 2),
        PixelFormat::Bgr24 => (2, 0),
    };

    let mut data = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        let luma = (299 * px[r] as u32 + 587 * px[1] as u32 + 114 * px[b] as u32 + 500) / 1000;
        let luma = luma.min(255) as u8;
        data.extend_from_slice(&[luma, luma, luma]);
    }
    data
}
