//! Session-scoped frame persistence with quota accounting.
//!
//! Every captured frame is written to `<session>/img<NNNNN>.jpg`. The store
//! keeps a running total of the on-disk size of everything it has written
//! and reports quota exhaustion only after the frame that crossed the
//! ceiling has been durably persisted.

use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Highest sequence number representable by the five-digit file name.
pub const MAX_SEQUENCE: u64 = 99_999;

/// Numeric placeholder pattern addressing stored frames in sequence order.
pub const FRAME_PATTERN: &str = "img%05d.jpg";

/// Errors that can occur while persisting frames.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session directory already exists: {0}")]
    SessionExists(PathBuf),

    #[error("Sequence number {sequence} exceeds the {limit} frame naming limit")]
    SequenceExhausted { sequence: u64, limit: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An encoded frame produced by a capture device.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes
    pub data: Bytes,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,
}

/// A frame that has been written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sequence: u64,
    pub size_bytes: u64,
}

/// The running total crossed the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Storage quota exhausted: {taken} bytes used of {max} allowed")]
pub struct QuotaExceeded {
    pub max: u64,
    pub taken: u64,
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The frame was written and usage is still within quota.
    Stored(StoredFile),

    /// The frame was written and usage now exceeds quota.
    QuotaExceeded {
        file: StoredFile,
        exceeded: QuotaExceeded,
    },
}

impl StoreOutcome {
    /// The file written by this store call.
    pub fn file(&self) -> &StoredFile {
        match self {
            StoreOutcome::Stored(file) => file,
            StoreOutcome::QuotaExceeded { file, .. } => file,
        }
    }
}

/// Usage statistics for the current session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub frames_stored: u64,
    pub bytes_used: u64,
    pub quota_bytes: u64,
    pub last_file: Option<PathBuf>,
}

impl SessionStats {
    /// Fraction of the quota consumed so far.
    pub fn quota_used_ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.quota_bytes as f64
    }
}

/// A timestamp-named capture session directory.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    dir: PathBuf,
}

impl Session {
    /// Create the session directory for `started_at` under `destination`.
    ///
    /// The destination is created if missing. An existing session directory
    /// is rejected so that a new session never overwrites earlier frames.
    pub async fn create(
        destination: &Path,
        started_at: DateTime<Local>,
    ) -> Result<Self, StoreError> {
        let id = started_at.format("%Y_%m_%d__%H_%M_%S").to_string();
        let dir = destination.join(&id);

        fs::create_dir_all(destination)
            .await
            .map_err(|e| StoreError::io(destination, e))?;

        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::SessionExists(dir));
            }
            Err(e) => return Err(StoreError::io(&dir, e)),
        }

        info!(session = %id, dir = %dir.display(), "Session directory created");

        Ok(Self { id, dir })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// File name for the frame with the given sequence number.
pub fn frame_file_name(sequence: u64) -> String {
    format!("img{:05}.jpg", sequence)
}

/// Quota-bounded frame store for a single session directory.
pub struct FrameStore {
    dir: PathBuf,
    quota_bytes: u64,
    next_sequence: u64,
    used_bytes: u64,
    stats: Arc<RwLock<SessionStats>>,
}

impl FrameStore {
    /// Create a store writing into `dir`, which must already exist.
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        let stats = SessionStats {
            quota_bytes,
            ..SessionStats::default()
        };

        Self {
            dir: dir.into(),
            quota_bytes,
            next_sequence: 0,
            used_bytes: 0,
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    /// The session directory frames are written to.
    pub fn location_path(&self) -> &Path {
        &self.dir
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Number of frames written so far.
    pub fn frames_stored(&self) -> u64 {
        self.next_sequence
    }

    /// Snapshot of the current session statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.read().clone()
    }

    /// Shared read handle for observers outside the capture loop.
    pub fn stats_handle(&self) -> Arc<RwLock<SessionStats>> {
        self.stats.clone()
    }

    /// Persist one frame and account for its on-disk size.
    ///
    /// The quota check happens after the write, so the frame that crosses the
    /// ceiling is always kept.
    pub async fn store(&mut self, frame: &Frame) -> Result<StoreOutcome, StoreError> {
        let sequence = self.next_sequence;
        if sequence > MAX_SEQUENCE {
            return Err(StoreError::SequenceExhausted {
                sequence,
                limit: MAX_SEQUENCE + 1,
            });
        }

        let path = self.dir.join(frame_file_name(sequence));
        let size_bytes = write_durably(&path, &frame.data).await?;

        self.next_sequence += 1;
        self.used_bytes += size_bytes;

        {
            let mut stats = self.stats.write();
            stats.frames_stored = self.next_sequence;
            stats.bytes_used = self.used_bytes;
            stats.last_file = Some(path.clone());
        }

        info!(
            path = %path.display(),
            sequence = sequence,
            size = format!("{}x{}", frame.width, frame.height),
            bytes = size_bytes,
            total_bytes = self.used_bytes,
            quota_bytes = self.quota_bytes,
            "Image persisted"
        );

        let file = StoredFile {
            path,
            sequence,
            size_bytes,
        };

        if self.used_bytes > self.quota_bytes {
            return Ok(StoreOutcome::QuotaExceeded {
                file,
                exceeded: QuotaExceeded {
                    max: self.quota_bytes,
                    taken: self.used_bytes,
                },
            });
        }

        Ok(StoreOutcome::Stored(file))
    }

    #[cfg(test)]
    fn with_next_sequence(mut self, sequence: u64) -> Self {
        self.next_sequence = sequence;
        self
    }
}

/// Write `data` to `path`, flush it to disk and return the resulting file size.
///
/// The bytes go to a `.part` sibling first and are renamed into place once
/// synced. On failure the partial file is removed, so `path` either holds the
/// complete frame or does not exist.
async fn write_durably(path: &Path, data: &[u8]) -> Result<u64, StoreError> {
    let partial = path.with_extension("jpg.part");

    match write_then_rename(&partial, path, data).await {
        Ok(size) => Ok(size),
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %partial.display(),
                        error = %cleanup,
                        "Failed to remove partial frame"
                    );
                }
            }
            Err(e)
        }
    }
}

async fn write_then_rename(partial: &Path, path: &Path, data: &[u8]) -> Result<u64, StoreError> {
    let mut file = fs::File::create(partial)
        .await
        .map_err(|e| StoreError::io(partial, e))?;
    file.write_all(data)
        .await
        .map_err(|e| StoreError::io(partial, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(partial, e))?;

    let metadata = file.metadata().await.map_err(|e| StoreError::io(partial, e))?;
    drop(file);

    fs::rename(partial, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    Ok(metadata.len())
}
