//! Camera streaming client: capture thread feeding a render tick

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camera_streaming_client::capture::{AnySource, CancelToken, Canceller};
use camera_streaming_client::display::{HeadlessSink, RenderTick};
use camera_streaming_client::pipeline::build_stage;
use camera_streaming_client::{
    utils, CaptureLoop, Config, ConnectionState, FrameBuffer, SourceOrigin, StatusEvent,
};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceArg {
    Auto,
    Index(u32),
}

fn parse_device(value: &str) -> Result<DeviceArg, String> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(DeviceArg::Auto);
    }
    value
        .parse()
        .map(DeviceArg::Index)
        .map_err(|_| format!("expected a device index or 'auto', got '{}'", value))
}

#[derive(Debug, Parser)]
#[command(name = "camera-streaming-client", version, about = "Live camera viewer")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MJPEG (http/https) or GStreamer stream URL
    #[arg(long, conflicts_with_all = ["device", "test_pattern"])]
    url: Option<String>,

    /// Local camera index, or `auto` to probe /dev/video*
    #[arg(long, value_parser = parse_device, conflicts_with = "test_pattern")]
    device: Option<DeviceArg>,

    /// Synthetic moving gradient instead of a camera
    #[arg(long)]
    test_pattern: bool,

    /// Convert frames to greyscale
    #[arg(long)]
    gray: bool,

    /// Scale frames to this width
    #[arg(long)]
    width: Option<u32>,

    /// Never open a window
    #[arg(long)]
    headless: bool,
}

impl Args {
    /// Command-line flags win over the loaded configuration
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(url) = &self.url {
            config.source.origin = SourceOrigin::Url(url.clone());
        }
        match self.device {
            Some(DeviceArg::Index(index)) => config.source.origin = SourceOrigin::Device(index),
            Some(DeviceArg::Auto) => {
                let found = utils::auto_detect_device()?;
                config.source.origin = SourceOrigin::Device(found.index);
                config.source.format = found.format;
            }
            None => {}
        }
        if self.test_pattern {
            config.source.origin = SourceOrigin::TestPattern;
        }
        if self.gray {
            config.processing.grayscale = true;
        }
        if self.width.is_some() {
            config.processing.output_width = self.width;
        }
        if self.headless {
            config.display.window = false;
        }
        Ok(())
    }
}

async fn log_status(events: flume::Receiver<StatusEvent>, shutdown: Arc<Canceller>) {
    while let Ok(event) = events.recv_async().await {
        match event.state {
            ConnectionState::Failed => {
                error!("Capture: {}", event);
                shutdown.cancel();
            }
            ConnectionState::Reconnecting => warn!("Capture: {}", event),
            _ => info!("Capture: {}", event),
        }
    }
}

async fn run_headless(tick: &mut RenderTick, fps: u32, shutdown: &CancelToken) {
    let mut sink = HeadlessSink::default();
    let mut interval = tokio::time::interval(Duration::from_secs(1) / fps.max(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick.tick(&mut sink) {
                    warn!("Failed to render frame: {}", e);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("Rendered {} frames", sink.rendered());
}

#[cfg(feature = "sdl2-display")]
fn run_window(config: &Config, tick: &mut RenderTick, shutdown: &CancelToken) -> Result<()> {
    use camera_streaming_client::display::Sdl2Display;

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut display = Sdl2Display::new(
        &sdl_context,
        "Camera Stream",
        config.display.width,
        config.display.height,
    )?;
    display.run(&sdl_context, tick, config.display.fps, shutdown)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("camera_streaming_client=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config)?;
    info!("Source: {:?}", config.source.origin);

    let source = AnySource::for_config(&config.source)?;
    let stage = build_stage(&config.processing);
    let buffer = Arc::new(FrameBuffer::new());
    let (status_tx, status_rx) = flume::unbounded();

    let mut capture = CaptureLoop::start(
        source,
        stage,
        config.source.clone(),
        buffer.clone(),
        status_tx,
    )?;

    // Ctrl-C and a terminal capture failure both end the render loop
    let shutdown = Arc::new(Canceller::new());
    let status_task = tokio::spawn(log_status(status_rx, shutdown.clone()));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
            }
            shutdown.cancel();
        });
    }

    let mut tick = RenderTick::new(buffer.clone());
    let token = shutdown.token();
    if config.display.window {
        #[cfg(feature = "sdl2-display")]
        run_window(&config, &mut tick, &token)?;
        #[cfg(not(feature = "sdl2-display"))]
        {
            warn!("Built without the sdl2-display feature, running headless");
            run_headless(&mut tick, config.display.fps, &token).await;
        }
    } else {
        run_headless(&mut tick, config.display.fps, &token).await;
    }

    // Joining the capture thread can block for one source read
    let capture = tokio::task::spawn_blocking(move || {
        capture.stop();
        capture
    })
    .await?;
    status_task.await?;

    let stats = buffer.stats();
    info!(
        "Published {} frames, {} never displayed",
        stats.written, stats.dropped
    );

    let status = capture.status();
    if status.state == ConnectionState::Failed {
        return Err(eyre!(
            "capture failed: {}",
            status.error.unwrap_or_default()
        ));
    }
    Ok(())
}
