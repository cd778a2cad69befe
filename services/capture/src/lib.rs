//! Timelapse Capture Service
//!
//! Captures still images from an attached camera at a fixed interval into a
//! timestamp-named session directory until a storage quota is exhausted,
//! then optionally assembles the frames into a video.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  capture_frame   ┌──────────────┐  store   ┌──────────────┐
//! │ Capture      │─────────────────▶│ Capture      │─────────▶│ Frame        │
//! │ Loop         │                  │ Source       │          │ Store        │
//! └──────────────┘                  └──────────────┘          └──────────────┘
//!        │ quota exhausted                 │                         │
//!        ▼                                 ▼                         ▼
//! ┌──────────────┐                  ┌──────────────┐          <session>/img00000.jpg
//! │ Video        │                  │ GStreamer    │          <session>/img00001.jpg
//! │ Assembler    │                  │ camera       │          ...
//! └──────────────┘                  └──────────────┘
//! ```

pub mod camera;
pub mod capture_loop;
pub mod config;
pub mod frame_store;
pub mod video;

pub use camera::{
    discover_default_device, CaptureError, CaptureSource, FrameSource, GstCamera, Resolution,
};
pub use capture_loop::{CaptureLoop, LoopOutcome, LoopState};
pub use config::{ConfigOverrides, ConfigValidationError, TimelapseConfig};
pub use frame_store::{
    Frame, FrameStore, QuotaExceeded, Session, SessionStats, StoreError, StoreOutcome, StoredFile,
};
pub use video::{FfmpegAssembler, VideoAssembler, VideoError};
