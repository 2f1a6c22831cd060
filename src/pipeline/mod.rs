pub mod gamma;
pub mod transform;

pub use gamma::{GammaTable, DEFAULT_GAMMA};
pub use transform::{
    crop_frame, gamma_correct_frame, scale_frame, CropSpec, DeviceGeometry, FrameTransformer,
    Interpolation, ScaleMode,
};
