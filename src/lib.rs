//! Stream frames from images and animations to WLED LED matrices over UDP or serial

pub mod capture;
pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod settings;
pub mod streamer;

pub use capture::{Frame, FrameSource, ImageSource, LoopingCapture};
pub use discovery::{discover, DeviceScanner, DiscoveredDevice, HttpProbe};
pub use error::{CaptureError, ConfigError, DiscoveryError, FanoutError, StreamError};
pub use pipeline::{CropSpec, DeviceGeometry, FrameTransformer, Interpolation, ScaleMode};
pub use session::{SessionEnd, SessionHandle, SessionSummary, StreamSession};
pub use settings::AppConfig;
pub use streamer::{DeviceStreamer, StreamManager, TransformSettings, Transport};
