//! Animated GIF decoded up front and replayed as a rewindable [`MediaStream`]

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage};
use tracing::{debug, info};

use crate::capture::source::MediaStream;
use crate::capture::Frame;
use crate::error::CaptureError;

pub struct GifStream {
    frames: Vec<Frame>,
    cursor: usize,
    frame_rate: Option<f64>,
    sequence: u64,
}

impl GifStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        debug!("Loading GIF from {}", path.display());

        let reader = BufReader::new(File::open(path)?);
        let decoded = GifDecoder::new(reader)?.into_frames().collect_frames()?;

        let mut total_ms = 0.0;
        let frames: Vec<Frame> = decoded
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                if denom != 0 {
                    total_ms += f64::from(numer) / f64::from(denom);
                }
                let rgb = DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8();
                Frame::from_rgb_image(rgb, index as u64)
            })
            .collect();

        if frames.is_empty() {
            return Err(CaptureError::SourceUnavailable(format!(
                "{}: no frames",
                path.display()
            )));
        }

        let mean_delay_ms = total_ms / frames.len() as f64;
        let frame_rate = (mean_delay_ms > 0.0).then(|| 1000.0 / mean_delay_ms);
        info!(
            "Preloaded {} frames from {} ({:?} fps)",
            frames.len(),
            path.display(),
            frame_rate
        );

        Ok(Self::from_frames(frames, frame_rate))
    }

    pub fn from_frames(frames: Vec<Frame>, frame_rate: Option<f64>) -> Self {
        Self {
            frames,
            cursor: 0,
            frame_rate,
            sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Size of the first frame
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frames.first().map(|f| (f.width(), f.height()))
    }
}

impl MediaStream for GifStream {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(frame) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        self.sequence += 1;
        Ok(Some(frame.with_sequence(self.sequence)))
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        self.cursor = 0;
        Ok(())
    }

    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn release(&mut self) {
        self.frames.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Frame as GifFrame, Rgba, RgbaImage};

    #[test]
    fn decodes_frames_and_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anim.gif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = GifEncoder::new(file);
            for shade in [0u8, 128, 255] {
                let buffer = RgbaImage::from_pixel(3, 2, Rgba([shade, shade, shade, 255]));
                let frame = GifFrame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(100, 1));
                encoder.encode_frame(frame).unwrap();
            }
        }

        let mut stream = GifStream::open(&path).unwrap();
        assert_eq!(stream.len(), 3);
        let rate = stream.frame_rate().unwrap();
        assert!((rate - 10.0).abs() < 0.5, "rate {}", rate);

        let first = stream.read_frame().unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (3, 2));
        stream.read_frame().unwrap().unwrap();
        stream.read_frame().unwrap().unwrap();
        assert!(stream.read_frame().unwrap().is_none());

        stream.rewind().unwrap();
        let again = stream.read_frame().unwrap().unwrap();
        assert_eq!(again.data, first.data);
    }
}
