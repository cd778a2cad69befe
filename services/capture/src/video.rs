//! Video assembly from stored frames using an external transcoder.
//!
//! Assembly is a two-phase contract: [`FfmpegAssembler::preflight`] runs once
//! before capturing starts so a missing tool fails fast, and
//! [`VideoAssembler::assemble`] runs once after the quota is exhausted.

use crate::config::VideoConfig;
use crate::frame_store::FRAME_PATTERN;
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors that can occur during video assembly.
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Video tool '{tool}' unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Failed to launch '{tool}': {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("'{tool}' exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Turns the frames of a session directory into a single video file.
#[async_trait]
pub trait VideoAssembler: Send + Sync {
    /// Assemble the session's frames and return the path of the video.
    async fn assemble(&self, session_dir: &Path) -> Result<PathBuf, VideoError>;
}

/// Assembler invoking ffmpeg (or a compatible tool) once per session.
pub struct FfmpegAssembler {
    config: VideoConfig,
}

impl FfmpegAssembler {
    pub fn new(config: VideoConfig) -> Self {
        Self { config }
    }

    /// Check that the configured tool can be executed.
    pub async fn preflight(&self) -> Result<(), VideoError> {
        let status = Command::new(&self.config.tool)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| VideoError::ToolUnavailable {
                tool: self.config.tool.clone(),
                reason: if e.kind() == io::ErrorKind::NotFound {
                    "not found in PATH".to_string()
                } else {
                    e.to_string()
                },
            })?;

        if !status.success() {
            return Err(VideoError::ToolUnavailable {
                tool: self.config.tool.clone(),
                reason: format!("version check exited with {}", status),
            });
        }

        info!(tool = %self.config.tool, "Video tool available");
        Ok(())
    }

    /// Path of the assembled video inside `session_dir`.
    pub fn output_path(&self, session_dir: &Path) -> PathBuf {
        session_dir.join(&self.config.output_name)
    }

    fn build_args(&self, session_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-y",
            "-loglevel",
            "error",
            "-framerate",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        args.push(self.config.framerate.to_string().into());
        args.push("-i".into());
        args.push(session_dir.join(FRAME_PATTERN).into_os_string());
        args.push("-c:v".into());
        args.push(self.config.codec.clone().into());
        args.push("-pix_fmt".into());
        args.push("yuv420p".into());
        args.push(self.output_path(session_dir).into_os_string());
        args
    }
}

#[async_trait]
impl VideoAssembler for FfmpegAssembler {
    async fn assemble(&self, session_dir: &Path) -> Result<PathBuf, VideoError> {
        let args = self.build_args(session_dir);
        debug!(tool = %self.config.tool, args = ?args, "Running video tool");

        let output = Command::new(&self.config.tool)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| VideoError::Launch {
                tool: self.config.tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(VideoError::Failed {
                tool: self.config.tool.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(self.output_path(session_dir))
    }
}
