//! Framed serial streaming
//!
//! Frame layout: `[0xC9, 0xDA, len_hi, len_lo] ++ rgb ++ [0x36]`, where `len`
//! is the RGB payload size in bytes.

use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn, Span};

use crate::error::StreamError;
use crate::pipeline::{DeviceGeometry, FrameTransformer};
use crate::streamer::info::WledState;
use crate::streamer::{queried_geometry, DeviceStreamer, TransformSettings};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const FRAME_MAGIC: [u8; 2] = [0xC9, 0xDA];
pub const FRAME_FOOTER: u8 = 0x36;
/// Request the device answers with one line of JSON state and info
pub const INFO_REQUEST: &[u8] = br#"{"v":true}"#;
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTarget {
    pub port: String,
    pub baud_rate: u32,
}

impl SerialTarget {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Wraps a row-major RGB buffer in the serial frame envelope.
///
/// The length field carries the low 16 bits of the payload size.
pub fn encode_serial_frame(rgb: &[u8]) -> Vec<u8> {
    let len = rgb.len();
    let mut message = Vec::with_capacity(len + 5);
    message.extend_from_slice(&FRAME_MAGIC);
    message.push(((len >> 8) & 0xFF) as u8);
    message.push((len & 0xFF) as u8);
    message.extend_from_slice(rgb);
    message.push(FRAME_FOOTER);
    message
}

/// Streamer over any byte transport; a real serial port by default
pub struct SerialStreamer<T = SerialStream> {
    port: Option<T>,
    target: String,
    transformer: FrameTransformer,
    span: Span,
}

impl SerialStreamer<SerialStream> {
    pub async fn open(
        target: &SerialTarget,
        settings: &TransformSettings,
        span: Span,
    ) -> Result<Self, StreamError> {
        let port = tokio_serial::new(&target.port, target.baud_rate)
            .timeout(READ_TIMEOUT)
            .open_native_async()?;
        let label = format!("serial://{}@{}", target.port, target.baud_rate);
        Self::with_transport(port, label, settings, span).await
    }
}

impl<T> SerialStreamer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn with_transport(
        mut port: T,
        target: String,
        settings: &TransformSettings,
        span: Span,
    ) -> Result<Self, StreamError> {
        let geometry = if settings.geometry.is_known() {
            settings.geometry
        } else {
            info!(parent: &span, "Getting dimensions from {}...", target);
            let queried = query_port_geometry(&mut port).await;
            queried_geometry(queried, &target, &span)?
        };

        if geometry.pixel_count() * 3 > u16::MAX as usize {
            warn!(
                parent: &span,
                "{}x{} payload overflows the 16-bit length field",
                geometry.width,
                geometry.height
            );
        }

        let transformer = settings.build(geometry)?;
        info!(
            parent: &span,
            width = geometry.width,
            height = geometry.height,
            "Streaming to {}",
            target
        );

        Ok(Self {
            port: Some(port),
            target,
            transformer,
            span,
        })
    }
}

async fn query_port_geometry<T>(port: &mut T) -> Result<DeviceGeometry, StreamError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    port.write_all(INFO_REQUEST).await?;
    port.flush().await?;

    let mut line = String::new();
    let mut reader = BufReader::new(port);
    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| StreamError::QueryTimeout)??;

    let state: WledState = serde_json::from_str(line.trim())?;
    Ok(state.info.geometry().unwrap_or_default())
}

#[async_trait]
impl<T> DeviceStreamer for SerialStreamer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn target(&self) -> &str {
        &self.target
    }

    fn transformer(&self) -> &FrameTransformer {
        &self.transformer
    }

    fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    async fn send(&mut self, image: &RgbImage) -> Result<(), StreamError> {
        let port = self.port.as_mut().ok_or(StreamError::Closed)?;
        let message = encode_serial_frame(image.as_raw());
        port.write_all(&message).await?;
        trace!(parent: &self.span, bytes = message.len(), "Frame sent");
        Ok(())
    }

    async fn query_geometry(&mut self) -> Result<DeviceGeometry, StreamError> {
        let port = self.port.as_mut().ok_or(StreamError::Closed)?;
        query_port_geometry(port).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let Some(mut port) = self.port.take() else {
            return Ok(());
        };
        // The handle is released on drop even if the flush fails
        let flushed = port.flush().await;
        drop(port);
        debug!(parent: &self.span, "Closed {}", self.target);
        flushed.map_err(StreamError::from)
    }
}
