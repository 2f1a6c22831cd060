pub mod colorspace;
pub mod frame;
pub mod gif;
pub mod looping;
pub mod source;
pub mod still;

pub use colorspace::ColorConversion;
pub use frame::Frame;
pub use frame::PixelFormat;
pub use gif::GifStream;
pub use looping::{CaptureOptions, LoopingCapture};
pub use source::{FrameSource, MediaStream};
pub use still::ImageSource;
