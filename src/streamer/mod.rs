//! Device streamers: wire encoding and transport to one LED matrix each

pub mod info;
pub mod manager;
pub mod serial;
pub mod udp;

use async_trait::async_trait;
use image::RgbImage;
use tracing::{debug, error, Span};

use crate::capture::Frame;
use crate::error::StreamError;
use crate::pipeline::{CropSpec, DeviceGeometry, FrameTransformer, Interpolation, ScaleMode};

pub use info::{WledInfo, WledState};
pub use manager::StreamManager;
pub use serial::{SerialStreamer, SerialTarget};
pub use udp::{UdpStreamer, UdpTarget};

/// Transform parameters shared by both transports.
///
/// `geometry` of `0x0` asks the device for its matrix size at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSettings {
    pub geometry: DeviceGeometry,
    pub crop: CropSpec,
    pub scale: ScaleMode,
    pub interpolation: Interpolation,
    pub gamma: f64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            geometry: DeviceGeometry::default(),
            crop: CropSpec::default(),
            scale: ScaleMode::Fill,
            interpolation: Interpolation::Smooth,
            gamma: crate::pipeline::DEFAULT_GAMMA,
        }
    }
}

impl TransformSettings {
    /// Builds the transformer once the final geometry is known
    pub fn build(&self, geometry: DeviceGeometry) -> Result<FrameTransformer, StreamError> {
        FrameTransformer::new(
            geometry,
            self.crop,
            self.scale,
            self.interpolation,
            self.gamma,
        )
        .map_err(|e| StreamError::InvalidConfig(e.to_string()))
    }
}

/// Where one destination's frames go
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Udp(UdpTarget),
    Serial(SerialTarget),
}

/// One physical destination: a transport plus its own transform.
#[async_trait]
pub trait DeviceStreamer: Send {
    /// Human readable destination, used in logs and errors
    fn target(&self) -> &str;

    fn transformer(&self) -> &FrameTransformer;

    fn is_closed(&self) -> bool;

    /// Encode and transmit an already transformed frame
    async fn send(&mut self, image: &RgbImage) -> Result<(), StreamError>;

    /// Ask the device for its matrix size over this streamer's own channel
    async fn query_geometry(&mut self) -> Result<DeviceGeometry, StreamError>;

    /// Release the socket or port. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), StreamError>;

    /// crop -> scale -> gamma -> send
    async fn process_and_send(&mut self, frame: &Frame) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let image = self.transformer().process(frame)?;
        self.send(&image).await
    }
}

/// Opens the streamer matching the transport selector
pub async fn connect(
    transport: &Transport,
    settings: &TransformSettings,
    span: Span,
) -> Result<Box<dyn DeviceStreamer>, StreamError> {
    match transport {
        Transport::Udp(target) => Ok(Box::new(UdpStreamer::connect(target, settings, span).await?)),
        Transport::Serial(target) => {
            Ok(Box::new(SerialStreamer::open(target, settings, span).await?))
        }
    }
}

/// Turns a device query outcome into the streamer's final geometry
pub(crate) fn queried_geometry(
    queried: Result<DeviceGeometry, StreamError>,
    target: &str,
    span: &Span,
) -> Result<DeviceGeometry, StreamError> {
    match queried {
        Ok(geometry) if geometry.is_known() => {
            debug!(parent: span, width = geometry.width, height = geometry.height, "Geometry reported by device");
            Ok(geometry)
        }
        Ok(_) => {
            error!(parent: span, "Dimensions not found in info from {}", target);
            Err(StreamError::GeometryUnavailable {
                target: target.to_string(),
            })
        }
        Err(e) => {
            error!(parent: span, "Could not get information from {}: {}", target, e);
            Err(StreamError::GeometryUnavailable {
                target: target.to_string(),
            })
        }
    }
}
