//! Crop, aspect-aware scale and gamma correction of a source frame to a matrix

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::Frame;
use crate::error::{ConfigError, StreamError};
use crate::pipeline::gamma::GammaTable;

/// Target matrix dimensions; `0x0` means "ask the device"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub width: u32,
    pub height: u32,
}

impl DeviceGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Margins removed from each edge of the source frame before scaling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropSpec {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropSpec {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Dimensions left after cropping, `None` if nothing would remain
    pub fn cropped_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let w = width.checked_sub(self.left)?.checked_sub(self.right)?;
        let h = height.checked_sub(self.top)?.checked_sub(self.bottom)?;
        (w > 0 && h > 0).then_some((w, h))
    }

    pub fn validate_for(&self, width: u32, height: u32) -> Result<(), ConfigError> {
        self.cropped_size(width, height).map(|_| ()).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "crop {:?} removes the whole {}x{} frame",
                self, width, height
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Resize to the matrix ignoring aspect ratio
    Stretch,
    /// Cover the matrix, cropping the overflowing axis
    #[default]
    Fill,
    /// Fit inside the matrix, padding the short axis
    Fit,
    /// No resize; center the source and crop or pad to the matrix
    #[serde(alias = "crop-center", alias = "center")]
    Crop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Nearest neighbour
    Hard,
    #[default]
    Smooth,
}

impl Interpolation {
    fn filter(self) -> FilterType {
        match self {
            Self::Hard => FilterType::Nearest,
            Self::Smooth => FilterType::Triangle,
        }
    }
}

/// Removes the crop margins from the leading and trailing edges
pub fn crop_frame(image: &RgbImage, crop: &CropSpec) -> Result<RgbImage, StreamError> {
    if crop.is_zero() {
        return Ok(image.clone());
    }

    let (width, height) = crop.cropped_size(image.width(), image.height()).ok_or_else(|| {
        StreamError::InvalidConfig(format!(
            "crop {:?} removes the whole {}x{} frame",
            crop,
            image.width(),
            image.height()
        ))
    })?;
    Ok(imageops::crop_imm(image, crop.left, crop.top, width, height).to_image())
}

/// Maps an arbitrary frame onto exactly `geometry` pixels
pub fn scale_frame(
    image: &RgbImage,
    geometry: DeviceGeometry,
    mode: ScaleMode,
    interpolation: Interpolation,
) -> RgbImage {
    let (target_w, target_h) = (geometry.width, geometry.height);
    let filter = interpolation.filter();

    if mode == ScaleMode::Stretch {
        return imageops::resize(image, target_w, target_h, filter);
    }

    let mut frame = match mode {
        ScaleMode::Fill | ScaleMode::Fit => {
            let (w, h) = aspect_size(image.width(), image.height(), geometry, mode);
            trace!(w, h, "aspect-preserving resize");
            imageops::resize(image, w, h, filter)
        }
        _ => image.clone(),
    };

    // Center-crop whichever axis still overflows
    if frame.width() > target_w || frame.height() > target_h {
        let w = frame.width().min(target_w);
        let h = frame.height().min(target_h);
        let left = (frame.width() - w) / 2;
        let top = (frame.height() - h) / 2;
        frame = imageops::crop_imm(&frame, left, top, w, h).to_image();
    }

    // Letterbox an undersized result, remainder pixel on the trailing side
    if frame.width() < target_w || frame.height() < target_h {
        let left = (target_w - frame.width()) / 2;
        let top = (target_h - frame.height()) / 2;
        let mut canvas = RgbImage::new(target_w, target_h);
        imageops::replace(&mut canvas, &frame, i64::from(left), i64::from(top));
        frame = canvas;
    }

    frame
}

/// Intermediate size for `Fill`/`Fit`, never collapsing an axis to zero
fn aspect_size(width: u32, height: u32, geometry: DeviceGeometry, mode: ScaleMode) -> (u32, u32) {
    let image_ratio = f64::from(width) / f64::from(height);
    let display_ratio = f64::from(geometry.width) / f64::from(geometry.height);

    let height_anchored = (mode == ScaleMode::Fill && image_ratio > display_ratio)
        || (mode == ScaleMode::Fit && image_ratio < display_ratio);

    if height_anchored {
        let w = (f64::from(geometry.height) * image_ratio).floor();
        (clamp_axis(w), geometry.height)
    } else {
        let h = (f64::from(geometry.width) / image_ratio).floor();
        (geometry.width, clamp_axis(h))
    }
}

fn clamp_axis(value: f64) -> u32 {
    value.clamp(1.0, f64::from(u32::MAX)) as u32
}

/// Applies the table to each channel of each pixel
pub fn gamma_correct_frame(mut image: RgbImage, table: &GammaTable) -> RgbImage {
    table.apply(&mut image);
    image
}

/// Per-destination transform parameters.
///
/// Stateless once built: the same transformer can process any number of frames
/// and several transformers can share one read-only source frame.
#[derive(Debug, Clone)]
pub struct FrameTransformer {
    geometry: DeviceGeometry,
    crop: CropSpec,
    scale: ScaleMode,
    interpolation: Interpolation,
    gamma: GammaTable,
}

impl FrameTransformer {
    pub fn new(
        geometry: DeviceGeometry,
        crop: CropSpec,
        scale: ScaleMode,
        interpolation: Interpolation,
        gamma: f64,
    ) -> Result<Self, ConfigError> {
        if !geometry.is_known() {
            return Err(ConfigError::Invalid(format!(
                "matrix geometry {}x{} must be non-zero",
                geometry.width, geometry.height
            )));
        }
        Ok(Self {
            geometry,
            crop,
            scale,
            interpolation,
            gamma: GammaTable::new(gamma)?,
        })
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    pub fn crop(&self) -> &CropSpec {
        &self.crop
    }

    /// crop -> scale -> gamma on an exclusive copy of the frame
    pub fn process(&self, frame: &Frame) -> Result<RgbImage, StreamError> {
        let image = frame.to_rgb_image();
        let image = crop_frame(&image, &self.crop)?;
        let image = scale_frame(&image, self.geometry, self.scale, self.interpolation);
        Ok(gamma_correct_frame(image, &self.gamma))
    }
}
