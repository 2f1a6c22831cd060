//! WLED JSON info documents and the HTTP query for them

use std::time::Duration;

use serde::Deserialize;

use crate::error::StreamError;
use crate::pipeline::DeviceGeometry;

/// Timeout for the geometry query a streamer makes at construction
pub const INFO_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of `GET /json` (and of the serial info reply)
#[derive(Debug, Clone, Deserialize)]
pub struct WledState {
    pub info: WledInfo,
}

/// Body of `GET /json/info`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WledInfo {
    #[serde(default)]
    pub leds: WledLeds,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ver: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WledLeds {
    #[serde(default)]
    pub count: Option<u32>,
    /// Present only on 2D (matrix) builds
    #[serde(default)]
    pub matrix: Option<WledMatrix>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WledMatrix {
    #[serde(default)]
    pub w: u32,
    #[serde(default)]
    pub h: u32,
}

impl WledInfo {
    /// Matrix size, `None` when the device is not configured as a matrix
    pub fn geometry(&self) -> Option<DeviceGeometry> {
        let matrix = self.leds.matrix?;
        let geometry = DeviceGeometry::new(matrix.w, matrix.h);
        geometry.is_known().then_some(geometry)
    }

    pub fn is_matrix(&self) -> bool {
        self.leds.matrix.is_some()
    }
}

/// HTTP client for devices on the local network; system proxies are bypassed
pub fn lan_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap_or_default()
}

/// `GET http://<authority>/json/info`
pub async fn fetch_info(
    client: &reqwest::Client,
    authority: &str,
) -> Result<WledInfo, StreamError> {
    let url = format!("http://{}/json/info", authority);
    let info = client
        .get(url)
        .timeout(INFO_QUERY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<WledInfo>()
        .await?;
    Ok(info)
}

/// Host and port as they appear in an HTTP authority
pub fn authority(host: &str, http_port: u16) -> String {
    if http_port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, http_port)
    }
}
