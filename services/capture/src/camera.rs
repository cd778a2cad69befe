//! Camera capture through a GStreamer pipeline.
//!
//! The device is opened once at startup and held for the lifetime of the
//! capture loop. Each capture pulls the most recent JPEG-encoded sample from
//! an `appsink` and hands it to the [`FrameStore`].

use crate::config::CameraConfig;
use crate::frame_store::{Frame, FrameStore, StoreError, StoreOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while opening or reading the capture device.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Invalid resolution '{0}': expected WIDTHxHEIGHT with integers in 1..=2147483647")]
    InvalidResolution(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Frame capture failed: {0}")]
    CaptureFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Largest width or height the caps negotiation can express.
const MAX_DIMENSION: u32 = i32::MAX as u32;

/// Capture resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CaptureError::InvalidResolution(s.to_string());

        let (width, height) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;

        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;

        // Caps fields are signed 32-bit integers
        let range = 1..=MAX_DIMENSION;
        if !range.contains(&width) || !range.contains(&height) {
            return Err(invalid());
        }

        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A device that yields encoded frames one at a time.
#[async_trait]
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    async fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Identifier of the underlying device.
    fn device(&self) -> &str;
}

/// Camera backed by a `v4l2src` GStreamer pipeline.
pub struct GstCamera {
    device: String,
    resolution: Resolution,
    capture_timeout: Duration,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstCamera {
    /// Open the device and start the pipeline at the given resolution.
    pub fn open(
        config: &CameraConfig,
        device: &str,
        resolution: Resolution,
    ) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("GStreamer initialization failed: {}", e))
        })?;

        let description = pipeline_description(device, config.jpeg_quality);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| {
                CaptureError::DeviceUnavailable("Failed to cast to Pipeline".to_string())
            })?;

        let capsfilter = pipeline
            .by_name("caps")
            .ok_or_else(|| CaptureError::DeviceUnavailable("capsfilter not found".to_string()))?;
        let caps = gst_video::VideoCapsBuilder::new()
            .width(resolution.width as i32)
            .height(resolution.height as i32)
            .build();
        capsfilter.set_property("caps", caps);

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::DeviceUnavailable("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| {
                CaptureError::DeviceUnavailable("Could not cast to AppSink".to_string())
            })?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let open_timeout = gst::ClockTime::from_nseconds(config.open_timeout().as_nanos() as u64);
        let (result, _state, _pending) = pipeline.state(open_timeout);

        if result.is_err() {
            let reason = pipeline_error(&pipeline)
                .unwrap_or_else(|| "Timeout waiting for device to start".to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CaptureError::DeviceUnavailable(format!("{}: {}", device, reason)));
        }

        info!(
            device = %device,
            resolution = %resolution,
            "Capture device started"
        );

        Ok(Self {
            device: device.to_string(),
            resolution,
            capture_timeout: config.capture_timeout(),
            pipeline,
            appsink,
        })
    }
}

#[async_trait]
impl FrameSource for GstCamera {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let sink = self.appsink.clone();
        let timeout = gst::ClockTime::from_nseconds(self.capture_timeout.as_nanos() as u64);

        let sample = tokio::task::spawn_blocking(move || sink.try_pull_sample(timeout))
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        let sample = match sample {
            Some(sample) => sample,
            None => {
                let reason = pipeline_error(&self.pipeline).unwrap_or_else(|| {
                    if self.appsink.is_eos() {
                        "Device reached end of stream".to_string()
                    } else {
                        format!("No frame within {:?}", self.capture_timeout)
                    }
                });
                return Err(CaptureError::CaptureFailed(reason));
            }
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::CaptureFailed("Sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let (width, height) = sample
            .caps()
            .and_then(|caps| caps.structure(0))
            .and_then(|s| Some((s.get::<i32>("width").ok()?, s.get::<i32>("height").ok()?)))
            .map(|(w, h)| (w as u32, h as u32))
            .unwrap_or((self.resolution.width, self.resolution.height));

        Ok(Frame {
            data,
            width,
            height,
        })
    }

    fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Build the launch description for the capture pipeline.
fn pipeline_description(device: &str, jpeg_quality: u32) -> String {
    format!(
        "v4l2src device=\"{device}\" \
         ! videoconvert ! videoscale \
         ! capsfilter name=caps \
         ! jpegenc quality={quality} \
         ! appsink name=sink sync=false max-buffers=1 drop=true",
        device = device,
        quality = jpeg_quality,
    )
}

/// Pop the first pending error message from the pipeline bus, if any.
fn pipeline_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
    }
}

/// Find the first video capture device known to GStreamer.
pub fn discover_default_device() -> Result<String, CaptureError> {
    gst::init().map_err(|e| {
        CaptureError::DeviceUnavailable(format!("GStreamer initialization failed: {}", e))
    })?;

    let monitor = gst::DeviceMonitor::new();
    monitor
        .add_filter(Some("Video/Source"), None)
        .ok_or_else(|| {
            CaptureError::DeviceUnavailable("Failed to add device monitor filter".to_string())
        })?;
    monitor
        .start()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
    let devices = monitor.devices();
    monitor.stop();

    let path = devices.iter().find_map(|device| {
        let props = device.properties()?;
        ["api.v4l2.path", "device.path"]
            .iter()
            .find_map(|key| props.get::<String>(*key).ok())
    });

    match path {
        Some(path) => {
            info!(device = %path, "Discovered default camera");
            Ok(path)
        }
        None => Err(CaptureError::DeviceUnavailable(
            "No video capture device found".to_string(),
        )),
    }
}

/// Pulls frames from a [`FrameSource`] and persists them.
pub struct CaptureSource<S> {
    source: S,
    store: FrameStore,
}

impl<S: FrameSource> CaptureSource<S> {
    pub fn new(source: S, store: FrameStore) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    pub fn device(&self) -> &str {
        self.source.device()
    }

    /// Capture one frame and write it to the store.
    ///
    /// Device errors are returned as-is; there is no retry.
    pub async fn capture_frame(&mut self) -> Result<StoreOutcome, CaptureError> {
        let frame = self.source.next_frame().await.map_err(|e| {
            warn!(device = %self.source.device(), error = %e, "Capture device failed");
            e
        })?;

        Ok(self.store.store(&frame).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Scripted source returning frames of the given sizes, then failing.
    pub(crate) struct ScriptedSource {
        pub sizes: Vec<usize>,
        pub pulled: usize,
    }

    impl ScriptedSource {
        pub fn new(sizes: Vec<usize>) -> Self {
            Self { sizes, pulled: 0 }
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            let size = *self
                .sizes
                .get(self.pulled)
                .ok_or_else(|| CaptureError::CaptureFailed("device unplugged".to_string()))?;
            self.pulled += 1;
            Ok(Frame {
                data: Bytes::from(vec![0xFF; size]),
                width: 640,
                height: 480,
            })
        }

        fn device(&self) -> &str {
            "scripted"
        }
    }

    #[test]
    fn test_parse_resolution() {
        let res: Resolution = "640x480".parse().unwrap();
        assert_eq!(res, Resolution { width: 640, height: 480 });
        assert_eq!(res.to_string(), "640x480");

        let res: Resolution = " 1920X1080 ".parse().unwrap();
        assert_eq!(res, Resolution { width: 1920, height: 1080 });
    }

    #[test]
    fn test_parse_resolution_rejects_malformed() {
        for input in ["640", "", "x480", "640x", "ax480", "640x480x3", "0x480", "640x0", "-640x480"] {
            assert!(
                matches!(input.parse::<Resolution>(), Err(CaptureError::InvalidResolution(_))),
                "{:?} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_parse_resolution_bounded_by_caps_range() {
        let res: Resolution = "2147483647x1".parse().unwrap();
        assert_eq!(res.width, i32::MAX as u32);

        for input in ["2147483648x480", "640x2147483648", "4294967295x4294967295"] {
            assert!(
                matches!(input.parse::<Resolution>(), Err(CaptureError::InvalidResolution(_))),
                "{:?} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_pipeline_description() {
        let description = pipeline_description("/dev/video0", 85);
        assert!(description.starts_with("v4l2src device=\"/dev/video0\""));
        assert!(description.contains("capsfilter name=caps"));
        assert!(description.contains("jpegenc quality=85"));
        assert!(description.contains("appsink name=sink"));
    }

    #[tokio::test]
    async fn test_capture_frame_delegates_to_store() {
        let dir = tempdir().unwrap();
        let store = FrameStore::new(dir.path(), 10_000);
        let mut source = CaptureSource::new(ScriptedSource::new(vec![300, 500]), store);

        let first = source.capture_frame().await.unwrap();
        assert_eq!(first.file().sequence, 0);
        let second = source.capture_frame().await.unwrap();
        assert_eq!(second.file().sequence, 1);

        assert_eq!(source.store().used_bytes(), 800);
        assert_eq!(source.device(), "scripted");
    }

    #[tokio::test]
    async fn test_capture_frame_propagates_quota_exhaustion() {
        let dir = tempdir().unwrap();
        let store = FrameStore::new(dir.path(), 100);
        let mut source = CaptureSource::new(ScriptedSource::new(vec![150]), store);

        let outcome = source.capture_frame().await.unwrap();
        assert!(matches!(outcome, StoreOutcome::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_device_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let store = FrameStore::new(dir.path(), 100);
        let mut source = CaptureSource::new(ScriptedSource::new(vec![]), store);

        let err = source.capture_frame().await.unwrap_err();
        assert!(matches!(err, CaptureError::CaptureFailed(_)));
        assert_eq!(source.store().frames_stored(), 0);
    }
}
