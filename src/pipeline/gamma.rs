//! Power-law brightness correction through a 256-entry lookup table

use image::RgbImage;

use crate::error::ConfigError;

pub const DEFAULT_GAMMA: f64 = 0.5;

/// Precomputed `byte -> byte` table for one gamma value
#[derive(Clone, PartialEq, Eq)]
pub struct GammaTable {
    table: [u8; 256],
}

impl GammaTable {
    /// Builds `round(255 * (i/255)^(1/gamma))` for every byte value
    pub fn new(gamma: f64) -> Result<Self, ConfigError> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gamma must be a positive number, got {}",
                gamma
            )));
        }

        let inverse = 1.0 / gamma;
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let value = 255.0 * (i as f64 / 255.0).powf(inverse);
            *entry = value.round().clamp(0.0, 255.0) as u8;
        }
        Ok(Self { table })
    }

    pub fn lookup(&self, value: u8) -> u8 {
        self.table[value as usize]
    }

    pub fn as_slice(&self) -> &[u8; 256] {
        &self.table
    }

    /// Applies the table to every channel of every pixel in place
    pub fn apply(&self, image: &mut RgbImage) {
        for channel in image.iter_mut() {
            *channel = self.table[*channel as usize];
        }
    }
}

impl std::fmt::Debug for GammaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GammaTable")
            .field("mid", &self.table[128])
            .finish_non_exhaustive()
    }
}
