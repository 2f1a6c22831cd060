//! Error types shared across the capture, pipeline and transport layers

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors raised while opening or pulling from a frame source
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The source could not produce its first frame
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("colorspace conversion failed: {0}")]
    Conversion(String),

    #[error("capture thread panicked")]
    ThreadPanicked,
}

/// Errors raised by a device streamer
#[derive(Debug, Error)]
pub enum StreamError {
    /// Matrix dimensions were not configured and the device did not report them
    #[error("device geometry unavailable for {target}")]
    GeometryUnavailable { target: String },

    /// Socket or serial write failure
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("frame buffer does not match {width}x{height} RGB")]
    FrameSize { width: u32, height: u32 },

    #[error("device info query timed out")]
    QueryTimeout,

    #[error("streamer already closed")]
    Closed,

    #[error("invalid streamer configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while scanning the local network
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not determine a local IPv4 address: {0}")]
    NoLocalAddress(String),

    #[error("no WLED device responded")]
    Empty,

    #[error("scan timed out")]
    Timeout,
}

/// Errors raised while loading or parsing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A free-form field such as `crop` could not be parsed
    #[error("cannot parse {field} from {input:?}: expected {expected}")]
    Parse {
        field: &'static str,
        input: String,
        expected: &'static str,
    },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-destination failures collected while fanning one frame out
#[derive(Debug, Default)]
pub struct FanoutError {
    pub failures: Vec<(usize, StreamError)>,
}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} destination(s) failed:", self.failures.len())?;
        for (index, err) in &self.failures {
            write!(f, " [{}] {};", index, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for FanoutError {}

impl FanoutError {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
