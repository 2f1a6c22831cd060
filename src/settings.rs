//! Configuration loading: a TOML file overlaid with `LEDCAST__*` environment variables

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capture::CaptureOptions;
use crate::discovery::{DiscoveredDevice, DEFAULT_CONCURRENCY};
use crate::error::ConfigError;
use crate::pipeline::{CropSpec, DeviceGeometry, Interpolation, ScaleMode, DEFAULT_GAMMA};
use crate::streamer::serial::DEFAULT_BAUD_RATE;
use crate::streamer::udp::DEFAULT_UDP_PORT;
use crate::streamer::{SerialTarget, TransformSettings, Transport, UdpTarget};

pub const ENV_PREFIX: &str = "LEDCAST";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub source: Option<SourceConfig>,
    pub devices: Vec<DeviceConfig>,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub fps: u32,
    /// Restart finite sources when they run out
    #[serde(rename = "loop")]
    pub loop_source: bool,
    pub read_timeout_ms: Option<u64>,
    /// Ignore the source's native frame rate
    pub nosync: bool,
    /// Queue decoded frames; when off only the newest frame is kept
    pub buffered: bool,
    /// Delay before the first read, in milliseconds
    pub time_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            loop_source: false,
            read_timeout_ms: None,
            nosync: false,
            buffered: true,
            time_delay_ms: 0,
        }
    }
}

impl SessionConfig {
    /// Capture settings for a looping source; the caller attaches a span
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            loop_stream: self.loop_source,
            buffered: self.buffered,
            nosync: self.nosync,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            time_delay: Some(Duration::from_millis(self.time_delay_ms))
                .filter(|delay| !delay.is_zero()),
            ..CaptureOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Image { path: PathBuf },
    Gif { path: PathBuf },
}

/// Crop as written in the file: a list of margins, one number, or a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CropInput {
    Margins(Vec<i64>),
    Uniform(i64),
    Text(String),
}

/// One physical destination. A non-empty `serialport` selects the serial
/// transport; otherwise `host` is used over UDP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: Option<String>,
    pub port: u16,
    pub http_port: u16,
    pub serialport: Option<String>,
    pub baudrate: u32,
    /// 0 asks the device
    pub width: u32,
    pub height: u32,
    pub crop: Option<CropInput>,
    pub scale: ScaleMode,
    pub interpolation: Interpolation,
    pub gamma: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_UDP_PORT,
            http_port: 80,
            serialport: None,
            baudrate: DEFAULT_BAUD_RATE,
            width: 0,
            height: 0,
            crop: None,
            scale: ScaleMode::default(),
            interpolation: Interpolation::default(),
            gamma: DEFAULT_GAMMA,
        }
    }
}

impl DeviceConfig {
    pub fn from_discovered(device: &DiscoveredDevice) -> Self {
        Self {
            host: Some(device.ip.clone()),
            width: device.width,
            height: device.height,
            ..Self::default()
        }
    }

    pub fn transport(&self) -> Result<Transport, ConfigError> {
        if let Some(port) = self.serialport.as_deref().filter(|p| !p.is_empty()) {
            return Ok(Transport::Serial(SerialTarget {
                port: port.to_string(),
                baud_rate: self.baudrate,
            }));
        }
        match self.host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => Ok(Transport::Udp(UdpTarget {
                host: host.to_string(),
                port: self.port,
                http_port: self.http_port,
            })),
            None => Err(ConfigError::Invalid(
                "device needs either a host or a serialport".into(),
            )),
        }
    }

    /// Malformed crop input is reported and replaced by zero margins
    pub fn crop_spec(&self) -> CropSpec {
        let parsed = match &self.crop {
            None => return CropSpec::default(),
            Some(CropInput::Margins(values)) => crop_from_values(values),
            Some(CropInput::Uniform(value)) => crop_from_values(&[*value]),
            Some(CropInput::Text(text)) => parse_crop(text),
        };
        parsed.unwrap_or_else(|e| {
            warn!("{}; using no crop", e);
            CropSpec::default()
        })
    }

    pub fn transform_settings(&self) -> TransformSettings {
        TransformSettings {
            geometry: DeviceGeometry::new(self.width, self.height),
            crop: self.crop_spec(),
            scale: self.scale,
            interpolation: self.interpolation,
            gamma: self.gamma,
        }
    }

    pub fn destination(&self) -> Result<(Transport, TransformSettings), ConfigError> {
        Ok((self.transport()?, self.transform_settings()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub concurrency: usize,
    pub timeout_ms: u64,
    /// Any address inside the /24 to scan; defaults to this host's
    pub subnet: Option<Ipv4Addr>,
    pub http_port: u16,
    /// Overall bound on the scan, in milliseconds
    pub deadline_ms: Option<u64>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: 200,
            subnet: None,
            http_port: 80,
            deadline_ms: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Reads `path` (if given) and applies `LEDCAST__SECTION__KEY` overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.fps == 0 {
            return Err(ConfigError::Invalid("fps must be greater than 0".into()));
        }
        for (index, device) in self.devices.iter().enumerate() {
            if !(device.gamma > 0.0 && device.gamma.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "device {}: gamma must be positive, got {}",
                    index, device.gamma
                )));
            }
            let negative = match &device.crop {
                Some(CropInput::Margins(values)) => values.iter().any(|v| *v < 0),
                Some(CropInput::Uniform(value)) => *value < 0,
                _ => false,
            };
            if negative {
                return Err(ConfigError::Invalid(format!(
                    "device {}: crop margins must not be negative ({:?})",
                    index, device.crop
                )));
            }
            device.transport()?;
        }
        Ok(())
    }

    /// Every device's crop must leave part of a `width`x`height` source frame
    pub fn validate_crops(&self, width: u32, height: u32) -> Result<(), ConfigError> {
        self.devices
            .iter()
            .try_for_each(|device| device.crop_spec().validate_for(width, height))
    }
}

/// Parses `"N"`, `"H,V"` or `"L,T,R,B"` into crop margins
pub fn parse_crop(input: &str) -> Result<CropSpec, ConfigError> {
    let parse_error = || ConfigError::Parse {
        field: "crop",
        input: input.to_string(),
        expected: "1, 2 or 4 comma separated non-negative integers",
    };

    let values = input
        .split(',')
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| parse_error())?;
    crop_from_values(&values).map_err(|_| parse_error())
}

fn crop_from_values(values: &[i64]) -> Result<CropSpec, ConfigError> {
    let margins = values
        .iter()
        .map(|v| u32::try_from(*v))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::Parse {
            field: "crop",
            input: format!("{:?}", values),
            expected: "non-negative margins",
        })?;

    match margins[..] {
        [all] => Ok(CropSpec::new(all, all, all, all)),
        [horizontal, vertical] => Ok(CropSpec::new(horizontal, vertical, horizontal, vertical)),
        [left, top, right, bottom] => Ok(CropSpec::new(left, top, right, bottom)),
        _ => Err(ConfigError::Parse {
            field: "crop",
            input: format!("{:?}", values),
            expected: "1, 2 or 4 values",
        }),
    }
}
