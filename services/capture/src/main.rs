//! Timelapse capture service.
//!
//! Captures images from a camera at a fixed interval until the configured
//! storage quota is used up, optionally assembling them into a video.
//!
//! # Architecture
//!
//! ```text
//! Camera -> GstCamera -> CaptureSource -> FrameStore -> <destination>/<session>/imgNNNNN.jpg
//!                              ^
//!                         CaptureLoop -> FfmpegAssembler (on quota exhaustion)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml, --config)
//! 2. Environment variables (prefixed with TIMELAPSE_)
//! 3. Command-line flags
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use timelapse_capture::config::{self, ConfigOverrides, TimelapseConfig};
use timelapse_capture::{
    discover_default_device, CaptureLoop, CaptureSource, FfmpegAssembler, FrameStore, GstCamera,
    LoopOutcome, Session, SessionStats,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line flags. Anything left unset falls back to files and environment.
#[derive(Parser, Debug)]
#[command(name = "timelapse")]
#[command(about = "Capture timelapse images until a storage quota is reached", long_about = None)]
struct Cli {
    /// Mount point of the camera (e.g. /dev/video0)
    #[arg(long)]
    camera: Option<String>,

    /// Resolution of images (e.g. 640x480)
    #[arg(long)]
    resolution: Option<String>,

    /// Max size of images in MB (e.g. 100)
    #[arg(long)]
    maxsize: Option<u64>,

    /// Interval in seconds between taken images (e.g. 10)
    #[arg(long)]
    interval: Option<u64>,

    /// Path to directory for storing images
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Assemble a video once the quota is reached
    #[arg(long)]
    video: bool,

    /// Additional configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl From<Cli> for ConfigOverrides {
    fn from(cli: Cli) -> Self {
        Self {
            config_file: cli.config,
            camera: cli.camera,
            resolution: cli.resolution,
            max_size_mb: cli.maxsize,
            interval_secs: cli.interval,
            destination: cli.destination,
            video: cli.video.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let overrides = ConfigOverrides::from(Cli::parse());

    // Load configuration
    let config =
        TimelapseConfig::load_with(&overrides).context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "timelapse",
        version = env!("CARGO_PKG_VERSION"),
        "Starting timelapse capture service"
    );

    // Validate configuration
    config.validate()?;

    match run(config).await {
        Ok(()) => {
            info!("Timelapse capture completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Timelapse capture failed");
            Err(e)
        }
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("timelapse={}", level).parse()?)
        .add_directive(format!("timelapse_capture={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Resolve devices and tools, then run the capture loop to completion.
async fn run(config: TimelapseConfig) -> Result<()> {
    let resolution = config.camera.parsed_resolution()?;
    let quota_bytes = config
        .storage
        .max_size_bytes()
        .context("Storage quota does not fit in a 64-bit byte count")?;

    // Check the optional video tool before anything long-running starts
    let assembler = if config.video.enabled {
        let assembler = FfmpegAssembler::new(config.video.clone());
        assembler
            .preflight()
            .await
            .context("Video assembly requested but the video tool is unavailable")?;
        Some(assembler)
    } else {
        None
    };

    let device = if config.camera.device.is_empty() {
        discover_default_device().context("No camera configured and none discovered")?
    } else {
        config.camera.device.clone()
    };

    info!(
        camera = %device,
        resolution = %resolution,
        max_size_mb = config.storage.max_size_mb,
        interval_secs = config.capture.interval_secs,
        destination = %config.storage.destination.display(),
        video = config.video.enabled,
        "Capture settings (quota may be exceeded by one image)"
    );

    let camera = GstCamera::open(&config.camera, &device, resolution)
        .context("Failed to open capture device")?;

    let session = Session::create(&config.storage.destination, Local::now())
        .await
        .context("Failed to create session directory")?;

    let store = FrameStore::new(session.dir(), quota_bytes);
    let stats = store.stats_handle();

    let cancel = CancellationToken::new();
    let mut capture_loop = CaptureLoop::new(
        CaptureSource::new(camera, store),
        config.capture.interval(),
        cancel.clone(),
    );
    if let Some(assembler) = assembler {
        capture_loop = capture_loop.with_assembler(Box::new(assembler));
    }

    // Cancel the loop on SIGINT/SIGTERM
    let signal_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Initiating graceful shutdown...");
            cancel.cancel();
        }
    });

    let reporter_handle = config.logging.report_interval().map(|interval| {
        let stats = stats.clone();
        let session_id = session.id().to_string();
        tokio::spawn(async move {
            run_progress_reporter(stats, session_id, interval).await;
        })
    });

    let result = capture_loop.run().await;

    signal_handle.abort();
    if let Some(handle) = reporter_handle {
        handle.abort();
    }

    log_final_stats(session.id(), &stats.read());

    match result? {
        LoopOutcome::Done {
            exceeded, video, ..
        } => {
            info!(
                session = %session.id(),
                summary = %exceeded,
                video = ?video,
                "Session complete"
            );
        }
        LoopOutcome::Cancelled { frames } => {
            info!(session = %session.id(), frames = frames, "Session stopped before quota");
        }
    }

    Ok(())
}

/// Periodically log session progress.
async fn run_progress_reporter(
    stats: Arc<RwLock<SessionStats>>,
    session_id: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let snapshot = stats.read().clone();
        info!(
            session = %session_id,
            frames_stored = snapshot.frames_stored,
            bytes_used = snapshot.bytes_used,
            quota_used = format!("{:.1}%", snapshot.quota_used_ratio() * 100.0),
            "Capture progress"
        );
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(session_id: &str, stats: &SessionStats) {
    info!("=== Final Statistics ===");
    info!(
        session = %session_id,
        frames_stored = stats.frames_stored,
        bytes_used = stats.bytes_used,
        quota_bytes = stats.quota_bytes,
        last_file = ?stats.last_file,
        "Session final stats"
    );
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
