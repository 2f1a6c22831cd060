//! WLED realtime UDP streaming using the DNRGB packet format
//!
//! Each datagram is `[4, 2, offset_hi, offset_lo]` followed by up to 480 RGB
//! pixels. The offset is the pixel index of the first pixel in the packet.
//! Delivery is fire-and-forget: nothing is acknowledged or retried.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use image::RgbImage;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, instrument, trace, Span};

use crate::error::StreamError;
use crate::pipeline::{DeviceGeometry, FrameTransformer};
use crate::streamer::info::{authority, fetch_info, lan_client};
use crate::streamer::{queried_geometry, DeviceStreamer, TransformSettings};

pub const DEFAULT_UDP_PORT: u16 = 21324;
pub const MESSAGE_TYPE_DNRGB: u8 = 4;
/// Seconds the device waits before leaving realtime mode
pub const REALTIME_TIMEOUT_SECS: u8 = 2;
pub const MAX_PIXELS_PER_PACKET: usize = 480;
pub const HEADER_LEN: usize = 4;

/// Highest start offset the 16-bit header field can address
const MAX_OFFSET: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpTarget {
    pub host: String,
    pub port: u16,
    /// Port of the device's JSON API, used for the geometry query
    pub http_port: u16,
}

impl UdpTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_UDP_PORT,
            http_port: 80,
        }
    }
}

/// Splits a row-major RGB buffer into DNRGB datagrams in increasing offset order
pub fn encode_dnrgb(rgb: &[u8]) -> Result<Vec<Vec<u8>>, StreamError> {
    if rgb.len() % 3 != 0 {
        return Err(StreamError::InvalidConfig(format!(
            "RGB payload of {} bytes is not a whole number of pixels",
            rgb.len()
        )));
    }

    let pixels = rgb.len() / 3;
    let mut packets = Vec::with_capacity(pixels.div_ceil(MAX_PIXELS_PER_PACKET));
    for (index, chunk) in rgb.chunks(MAX_PIXELS_PER_PACKET * 3).enumerate() {
        let offset = index * MAX_PIXELS_PER_PACKET;
        if offset > MAX_OFFSET {
            return Err(StreamError::InvalidConfig(format!(
                "{} pixels exceed the DNRGB offset range",
                pixels
            )));
        }

        let mut packet = Vec::with_capacity(HEADER_LEN + chunk.len());
        packet.extend_from_slice(&[
            MESSAGE_TYPE_DNRGB,
            REALTIME_TIMEOUT_SECS,
            (offset >> 8) as u8,
            (offset & 0xFF) as u8,
        ]);
        packet.extend_from_slice(chunk);
        packets.push(packet);
    }
    Ok(packets)
}

/// Largest matrix whose last packet offset still fits the header
pub fn max_dnrgb_pixels() -> usize {
    (MAX_OFFSET / MAX_PIXELS_PER_PACKET + 1) * MAX_PIXELS_PER_PACKET
}

pub struct UdpStreamer {
    socket: Option<UdpSocket>,
    device: SocketAddr,
    target: String,
    http_port: u16,
    http: reqwest::Client,
    transformer: FrameTransformer,
    span: Span,
}

impl UdpStreamer {
    /// Resolves the host, binds a local socket and settles the matrix geometry.
    ///
    /// The socket stays unconnected so ICMP errors from the device side never
    /// surface on later sends.
    #[instrument(level = "debug", parent = &span, skip_all, fields(host = %target.host, port = target.port))]
    pub async fn connect(
        target: &UdpTarget,
        settings: &TransformSettings,
        span: Span,
    ) -> Result<Self, StreamError> {
        let device = resolve(&target.host, target.port).await?;
        let label = format!("udp://{}", device);

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

        let http = lan_client();
        let geometry = if settings.geometry.is_known() {
            settings.geometry
        } else {
            info!(parent: &span, "Getting dimensions from {}...", label);
            let queried = query_http_geometry(&http, device.ip(), target.http_port).await;
            queried_geometry(queried, &label, &span)?
        };

        if geometry.pixel_count() > max_dnrgb_pixels() {
            return Err(StreamError::InvalidConfig(format!(
                "{}x{} matrix exceeds the DNRGB addressing range",
                geometry.width, geometry.height
            )));
        }

        let transformer = settings.build(geometry)?;
        info!(
            parent: &span,
            width = geometry.width,
            height = geometry.height,
            "Streaming to {}",
            label
        );

        Ok(Self {
            socket: Some(socket),
            device,
            target: label,
            http_port: target.http_port,
            http,
            transformer,
            span,
        })
    }

    pub fn device_addr(&self) -> SocketAddr {
        self.device
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, StreamError> {
    let mut addrs = lookup_host((host, port)).await?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StreamError::InvalidConfig(format!("{} has no IPv4 address", host)))
}

async fn query_http_geometry(
    http: &reqwest::Client,
    ip: IpAddr,
    http_port: u16,
) -> Result<DeviceGeometry, StreamError> {
    let info = fetch_info(http, &authority(&ip.to_string(), http_port)).await?;
    Ok(info.geometry().unwrap_or_default())
}

#[async_trait]
impl DeviceStreamer for UdpStreamer {
    fn target(&self) -> &str {
        &self.target
    }

    fn transformer(&self) -> &FrameTransformer {
        &self.transformer
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    async fn send(&mut self, image: &RgbImage) -> Result<(), StreamError> {
        let socket = self.socket.as_ref().ok_or(StreamError::Closed)?;
        let packets = encode_dnrgb(image.as_raw())?;
        for packet in &packets {
            socket.send_to(packet, self.device).await?;
        }
        trace!(parent: &self.span, packets = packets.len(), "Frame sent");
        Ok(())
    }

    async fn query_geometry(&mut self) -> Result<DeviceGeometry, StreamError> {
        query_http_geometry(&self.http, self.device.ip(), self.http_port).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.socket.take().is_some() {
            debug!(parent: &self.span, "Closed {}", self.target);
        }
        Ok(())
    }
}
