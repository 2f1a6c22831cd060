//! Still-image source: one decoded picture, returned on every read

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capture::source::FrameSource;
use crate::capture::Frame;
use crate::error::CaptureError;

pub struct ImageSource {
    frame: Frame,
    sequence: u64,
}

impl ImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        debug!("Loading image from {}", path.display());

        let image = image::open(path)
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(CaptureError::SourceUnavailable(format!(
                "{}: image is empty",
                path.display()
            )));
        }

        info!(
            "Loaded {}x{} image from {}",
            image.width(),
            image.height(),
            path.display()
        );
        Ok(Self::from_frame(Frame::from_rgb_image(image, 0)))
    }

    pub fn from_frame(frame: Frame) -> Self {
        Self { frame, sequence: 0 }
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.frame.width(), self.frame.height())
    }
}

#[async_trait]
impl FrameSource for ImageSource {
    async fn read(&mut self) -> Option<Frame> {
        self.sequence += 1;
        Some(self.frame.with_sequence(self.sequence))
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}
