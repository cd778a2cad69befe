//! Configuration management for the timelapse capture service.
//!
//! This module handles loading and validating configuration from files,
//! environment variables and command-line overrides. The result is resolved
//! once at startup and handed to the capture core by value.

use crate::camera::Resolution;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Bytes per configured megabyte.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Main configuration for the capture service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelapseConfig {
    /// Camera device configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// Session storage and quota configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Capture cadence configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Video assembly configuration
    #[serde(default)]
    pub video: VideoConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Camera device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Device identifier (e.g., "/dev/video0"). Empty means auto-discover.
    #[serde(default)]
    pub device: String,

    /// Image resolution as "WxH"
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Time allowed for the device pipeline to start, in seconds
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,

    /// Time allowed for a single frame to arrive, in seconds
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,

    /// JPEG encoder quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
}

/// Session storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory under which session directories are created
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Storage quota in megabytes
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
}

/// Capture cadence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Delay between the end of one capture and the start of the next, in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

/// Video assembly configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    /// Whether to assemble a video once the quota is exhausted
    #[serde(default)]
    pub enabled: bool,

    /// Transcoding tool to invoke
    #[serde(default = "default_video_tool")]
    pub tool: String,

    /// Output frame rate
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Output video codec
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Output file name inside the session directory
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Interval between progress reports in seconds (0 disables reporting)
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

/// Values supplied on the command line, applied on top of every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub camera: Option<String>,
    pub resolution: Option<String>,
    pub max_size_mb: Option<u64>,
    pub interval_secs: Option<u64>,
    pub destination: Option<PathBuf>,
    pub video: Option<bool>,
}

// Default value functions
fn default_resolution() -> String {
    "640x480".to_string()
}
fn default_open_timeout() -> u64 {
    10
}
fn default_capture_timeout() -> u64 {
    10
}
fn default_jpeg_quality() -> u32 {
    85
}
fn default_destination() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("timelapse-pics")
}
fn default_max_size_mb() -> u64 {
    100
}
fn default_interval() -> u64 {
    10
}
fn default_video_tool() -> String {
    "ffmpeg".to_string()
}
fn default_framerate() -> u32 {
    24
}
fn default_codec() -> String {
    "libx264".to_string()
}
fn default_output_name() -> String {
    "output.mp4".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_report_interval() -> u64 {
    60
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            resolution: default_resolution(),
            open_timeout_secs: default_open_timeout(),
            capture_timeout_secs: default_capture_timeout(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            max_size_mb: default_max_size_mb(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tool: default_video_tool(),
            framerate: default_framerate(),
            codec: default_codec(),
            output_name: default_output_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl TimelapseConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(&ConfigOverrides::default())
    }

    /// Load configuration, applying command-line overrides last.
    ///
    /// Sources in order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Explicit config file passed with `--config`
    /// 4. Environment variables (prefixed with TIMELAPSE_)
    /// 5. Command-line flags
    pub fn load_with(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Some(path) = &overrides.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        let builder = builder.add_source(
            Environment::with_prefix("TIMELAPSE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        apply_overrides(builder, overrides)?
            .build()?
            .try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.camera.parsed_resolution()?;

        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.storage.destination.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.destination".to_string(),
            ));
        }

        if self.storage.max_size_mb == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_size_mb".to_string(),
                message: "Quota must be greater than 0".to_string(),
            });
        }
        if self.storage.max_size_bytes().is_none() {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_size_mb".to_string(),
                message: format!(
                    "Quota of {} MB does not fit in a 64-bit byte count",
                    self.storage.max_size_mb
                ),
            });
        }

        if self.video.enabled {
            if self.video.tool.is_empty() {
                return Err(ConfigValidationError::MissingField("video.tool".to_string()));
            }
            if self.video.framerate == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "video.framerate".to_string(),
                    message: "Frame rate must be greater than 0".to_string(),
                });
            }
            if self.video.output_name.is_empty() {
                return Err(ConfigValidationError::MissingField(
                    "video.output_name".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn apply_overrides(
    builder: ConfigBuilder<DefaultState>,
    overrides: &ConfigOverrides,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_override_option("camera.device", overrides.camera.clone())?
        .set_override_option("camera.resolution", overrides.resolution.clone())?
        .set_override_option(
            "storage.max_size_mb",
            override_int("storage.max_size_mb", overrides.max_size_mb)?,
        )?
        .set_override_option(
            "storage.destination",
            overrides
                .destination
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )?
        .set_override_option(
            "capture.interval_secs",
            override_int("capture.interval_secs", overrides.interval_secs)?,
        )?
        .set_override_option("video.enabled", overrides.video)
}

fn override_int(key: &str, value: Option<u64>) -> Result<Option<i64>, ConfigError> {
    value
        .map(|v| {
            i64::try_from(v)
                .map_err(|_| ConfigError::Message(format!("{} is out of range: {}", key, v)))
        })
        .transpose()
}

impl CameraConfig {
    /// Parse the configured resolution string.
    pub fn parsed_resolution(&self) -> Result<Resolution, ConfigValidationError> {
        self.resolution
            .parse()
            .map_err(|e: crate::camera::CaptureError| ConfigValidationError::InvalidValue {
                field: "camera.resolution".to_string(),
                message: e.to_string(),
            })
    }

    /// Get the device open timeout as Duration.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// Get the per-frame capture timeout as Duration.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }
}

impl StorageConfig {
    /// Quota in bytes, or `None` if it does not fit in a `u64`.
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_mb.checked_mul(BYTES_PER_MB)
    }
}

impl CaptureConfig {
    /// Get the inter-capture delay as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl LoggingConfig {
    /// Progress report interval, or `None` when reporting is disabled.
    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
