pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{CancelToken, Frame, FrameSource};
pub use error::{ConnectError, PipelineError, ProcessingError, ReadError};
pub use pipeline::{CaptureLoop, ConnectionState, FrameBuffer, ProcessingStage, StatusEvent};

/// Prefix for environment overrides, e.g. `CAMSTREAM__SOURCE__FPS=15`
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub processing: ProcessingConfig,
    pub display: DisplayConfig,
}

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    /// Local camera, `/dev/video{index}`
    Device(u32),
    /// Network stream (http(s) MJPEG, or any URI the GStreamer backend can decode)
    Url(String),
    /// Synthetic moving gradient
    TestPattern,
}

/// Connection descriptor for one streaming session.
/// Moved into the capture thread on start; changing it requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub origin: SourceOrigin,
    pub width: u32,
    pub height: u32,
    /// Frame rate hint
    pub fps: u32,
    /// Pixel format requested from local devices
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Re-attempts after the first failure before giving up
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of each backoff delay that is randomized, 0.0..=1.0
    pub backoff_jitter: f64,
    /// Consecutive read timeouts tolerated before the connection counts as lost
    pub max_consecutive_timeouts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub grayscale: bool,
    /// Scale frames to this width, keeping the aspect ratio
    pub output_width: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Render tick rate
    pub fps: u32,
    /// Open a window (requires the `sdl2-display` feature), headless otherwise
    pub window: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            origin: SourceOrigin::Device(0),
            width: 800,
            height: 600,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 2_000,
            max_retries: 5,
            backoff_base_ms: 250,
            backoff_cap_ms: 5_000,
            backoff_jitter: 0.2,
            max_consecutive_timeouts: 5,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            fps: 24,
            window: cfg!(feature = "sdl2-display"),
        }
    }
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Interval between frames at the configured rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Rejects settings no source could honour
    pub fn validate(&self) -> Result<(), String> {
        if self.fps == 0 {
            return Err("fps must be positive".into());
        }
        if self.width == 0 || self.height == 0 {
            return Err(format!("invalid resolution {}x{}", self.width, self.height));
        }
        if self.buffer_count == 0 {
            return Err("buffer_count must be positive".into());
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err("timeouts must be positive".into());
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(format!(
                "backoff must satisfy 0 < base ({}ms) <= cap ({}ms)",
                self.backoff_base_ms, self.backoff_cap_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(format!("backoff_jitter {} outside 0..=1", self.backoff_jitter));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err("max_consecutive_timeouts must be at least 1".into());
        }
        if let SourceOrigin::Url(url) = &self.origin {
            url::Url::parse(url).map_err(|e| format!("invalid stream url '{url}': {e}"))?;
        }
        Ok(())
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by `CAMSTREAM__*` variables.
    /// Missing keys fall back to the serde defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
