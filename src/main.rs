//! ledcast: stream a still image or GIF to one or more WLED matrices

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use ledcast::capture::{FrameSource, GifStream, ImageSource, LoopingCapture};
use ledcast::discovery::{discover, DeviceScanner, HttpProbe};
use ledcast::settings::{AppConfig, DeviceConfig, SourceConfig};
use ledcast::{StreamManager, StreamSession};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("ledcast launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = AppConfig::load(config_path.as_deref())?;

    // Fill in a destination from the network when none is configured
    if config.devices.is_empty() {
        let scanner = DeviceScanner::new(
            HttpProbe::new(config.discovery.probe_timeout(), config.discovery.http_port),
            config.discovery.concurrency,
            info_span!("discovery"),
        );
        let device = discover(&scanner, config.discovery.subnet, config.discovery.deadline())
            .await
            .map_err(|e| eyre!("no device configured and discovery failed: {}", e))?;
        info!("Using discovered device {} ({}x{})", device.ip, device.width, device.height);
        config.devices.push(DeviceConfig::from_discovered(&device));
    }

    let source_config = config
        .source
        .clone()
        .ok_or_else(|| eyre!("no source configured"))?;
    let mut source = open_source(&source_config, &config)?;

    let destinations = config
        .devices
        .iter()
        .map(DeviceConfig::destination)
        .collect::<Result<Vec<_>, _>>()?;

    let mut manager = match StreamManager::connect_all(&destinations, info_span!("streamers")).await {
        Ok(manager) => manager,
        Err(e) => {
            if let Err(stop_err) = source.stop().await {
                warn!("Stopping source failed: {}", stop_err);
            }
            return Err(e.into());
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping");
                on_signal.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    let session = StreamSession::new(config.session.fps, info_span!("session"))?;
    let summary = session.run(source.as_mut(), &mut manager, cancel).await;

    info!(
        frames = summary.frames,
        late = summary.late_frames,
        failed = summary.fanout_failures,
        "ledcast shutting down"
    );
    Ok(())
}

fn open_source(source: &SourceConfig, config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    match source {
        SourceConfig::Image { path } => {
            let image = ImageSource::open(path)?;
            let (width, height) = image.frame_size();
            config.validate_crops(width, height)?;
            Ok(Box::new(image))
        }
        SourceConfig::Gif { path } => {
            let gif = GifStream::open(path)?;
            if let Some((width, height)) = gif.frame_size() {
                config.validate_crops(width, height)?;
            }
            let mut options = config.session.capture_options();
            options.span = info_span!("capture", path = %path.display());
            let mut capture = LoopingCapture::new(Box::new(gif), options)?;
            capture.start()?;
            Ok(Box::new(capture))
        }
    }
}

#[cfg(not(feature = "profiling"))]
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

#[cfg(feature = "profiling")]
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(default_filter())
        .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
        .with(tracing_tracy::TracyLayer::default())
        .init();
}

fn default_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ledcast=info"))
}
