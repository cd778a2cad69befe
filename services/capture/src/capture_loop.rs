//! Fixed-delay capture loop bounded by the storage quota.
//!
//! ```text
//! Running --(frame stored)-------> Running
//! Running --(quota exhausted)----> Done      -> optional video assembly
//! Running --(device/store error)-> Aborted   -> error returned to caller
//! Running --(cancelled at tick)--> Cancelled
//! ```
//!
//! The delay is measured from the end of one capture to the start of the
//! next, so the effective frame period is `interval + capture time`.

use crate::camera::{CaptureError, CaptureSource, FrameSource};
use crate::frame_store::{QuotaExceeded, StoreOutcome};
use crate::video::VideoAssembler;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// State of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Done,
    Aborted,
    Cancelled,
}

/// How a capture loop that did not abort came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The quota was exhausted.
    Done {
        exceeded: QuotaExceeded,
        frames: u64,
        /// Path of the assembled video, if assembly was requested and succeeded
        video: Option<PathBuf>,
    },

    /// The cancellation token fired between captures.
    Cancelled { frames: u64 },
}

/// Drives periodic captures until quota exhaustion, error or cancellation.
pub struct CaptureLoop<S> {
    source: CaptureSource<S>,
    interval: Duration,
    assembler: Option<Box<dyn VideoAssembler>>,
    cancel: CancellationToken,
    state: LoopState,
}

impl<S: FrameSource> CaptureLoop<S> {
    pub fn new(source: CaptureSource<S>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            source,
            interval,
            assembler: None,
            cancel,
            state: LoopState::Running,
        }
    }

    /// Assemble a video with `assembler` once the quota is exhausted.
    pub fn with_assembler(mut self, assembler: Box<dyn VideoAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn source(&self) -> &CaptureSource<S> {
        &self.source
    }

    /// Run until a terminal state is reached.
    ///
    /// Fatal errors are returned unchanged; frames already written stay on disk.
    pub async fn run(&mut self) -> Result<LoopOutcome, CaptureError> {
        info!(
            device = %self.source.device(),
            dir = %self.source.store().location_path().display(),
            interval_secs = self.interval.as_secs_f64(),
            quota_bytes = self.source.store().quota_bytes(),
            "Capture loop started"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled());
            }

            match self.source.capture_frame().await {
                Ok(StoreOutcome::Stored(_)) => {}
                Ok(StoreOutcome::QuotaExceeded { file, exceeded }) => {
                    self.state = LoopState::Done;
                    info!(
                        last = %file.path.display(),
                        frames = self.source.store().frames_stored(),
                        quota_bytes = exceeded.max,
                        used_bytes = exceeded.taken,
                        "Storage quota exhausted, capture finished"
                    );

                    let video = self.assemble_video().await;
                    return Ok(LoopOutcome::Done {
                        exceeded,
                        frames: self.source.store().frames_stored(),
                        video,
                    });
                }
                Err(e) => {
                    self.state = LoopState::Aborted;
                    error!(
                        error = %e,
                        frames = self.source.store().frames_stored(),
                        "Capture loop aborted"
                    );
                    return Err(e);
                }
            }

            let interrupted = tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = tokio::time::sleep(self.interval) => false,
            };
            if interrupted {
                return Ok(self.cancelled());
            }
        }
    }

    fn cancelled(&mut self) -> LoopOutcome {
        self.state = LoopState::Cancelled;
        let frames = self.source.store().frames_stored();
        info!(frames = frames, "Capture loop cancelled");
        LoopOutcome::Cancelled { frames }
    }

    /// Best-effort assembly; failures are logged and swallowed.
    async fn assemble_video(&self) -> Option<PathBuf> {
        let assembler = self.assembler.as_ref()?;
        let dir = self.source.store().location_path();

        info!(dir = %dir.display(), "Assembling video");
        match assembler.assemble(dir).await {
            Ok(path) => {
                info!(video = %path.display(), "Video assembled");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, dir = %dir.display(), "Video assembly failed, frames kept");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::ScriptedSource;
    use crate::frame_store::{Frame, FrameStore};
    use crate::video::VideoError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tokio::time::Instant;

    struct RecordingAssembler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl VideoAssembler for RecordingAssembler {
        async fn assemble(&self, session_dir: &Path) -> Result<PathBuf, VideoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VideoError::ToolUnavailable {
                    tool: "fake".to_string(),
                    reason: "broken".to_string(),
                });
            }
            Ok(session_dir.join("output.mp4"))
        }
    }

    fn recording(fail: bool) -> (Box<dyn VideoAssembler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let assembler = RecordingAssembler {
            calls: calls.clone(),
            fail,
        };
        (Box::new(assembler), calls)
    }

    /// Source that records when each pull starts and takes `capture_time` to deliver.
    struct TimedSource {
        pulls: Arc<Mutex<Vec<Instant>>>,
        capture_time: Duration,
        size: usize,
    }

    #[async_trait]
    impl FrameSource for TimedSource {
        async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            self.pulls.lock().push(Instant::now());
            tokio::time::sleep(self.capture_time).await;
            Ok(Frame {
                data: Bytes::from(vec![0x11; self.size]),
                width: 640,
                height: 480,
            })
        }

        fn device(&self) -> &str {
            "timed"
        }
    }

    fn build_loop(sizes: Vec<usize>, quota: u64) -> (CaptureLoop<ScriptedSource>, TempDir) {
        let dir = tempdir().unwrap();
        let store = FrameStore::new(dir.path(), quota);
        let source = CaptureSource::new(ScriptedSource::new(sizes), store);
        let capture_loop = CaptureLoop::new(source, Duration::ZERO, CancellationToken::new());
        (capture_loop, dir)
    }

    #[tokio::test]
    async fn test_single_capture_when_frame_exceeds_quota() {
        let (mut capture_loop, dir) = build_loop(vec![500, 500, 500], 100);

        let outcome = capture_loop.run().await.unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Done {
                exceeded: QuotaExceeded { max: 100, taken: 500 },
                frames: 1,
                video: None,
            }
        );
        assert_eq!(capture_loop.state(), LoopState::Done);
        assert!(dir.path().join("img00000.jpg").exists());
        assert!(!dir.path().join("img00001.jpg").exists());
    }

    #[tokio::test]
    async fn test_megabyte_quota_scenario() {
        let (mut capture_loop, dir) = build_loop(vec![400_000; 5], 1_048_576);

        let outcome = capture_loop.run().await.unwrap();

        match outcome {
            LoopOutcome::Done { exceeded, frames, .. } => {
                assert_eq!(exceeded.max, 1_048_576);
                assert_eq!(exceeded.taken, 1_200_000);
                assert_eq!(frames, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        for name in ["img00000.jpg", "img00001.jpg", "img00002.jpg"] {
            assert!(dir.path().join(name).exists());
        }
        assert!(!dir.path().join("img00003.jpg").exists());
    }

    #[tokio::test]
    async fn test_video_assembled_on_done() {
        let (capture_loop, dir) = build_loop(vec![200], 100);
        let (assembler, calls) = recording(false);
        let mut capture_loop = capture_loop.with_assembler(assembler);

        let outcome = capture_loop.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome,
            LoopOutcome::Done { video: Some(ref p), .. } if p == &dir.path().join("output.mp4")
        ));
    }

    #[tokio::test]
    async fn test_video_failure_does_not_change_outcome() {
        let (capture_loop, _dir) = build_loop(vec![200], 100);
        let (assembler, calls) = recording(true);
        let mut capture_loop = capture_loop.with_assembler(assembler);

        let outcome = capture_loop.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, LoopOutcome::Done { video: None, .. }));
        assert_eq!(capture_loop.state(), LoopState::Done);
    }

    #[tokio::test]
    async fn test_no_video_on_abort() {
        let (capture_loop, dir) = build_loop(vec![10, 10], 1_000);
        let (assembler, calls) = recording(false);
        let mut capture_loop = capture_loop.with_assembler(assembler);

        let err = capture_loop.run().await.unwrap_err();

        assert!(matches!(err, CaptureError::CaptureFailed(_)));
        assert_eq!(capture_loop.state(), LoopState::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(dir.path().join("img00000.jpg").exists());
        assert!(dir.path().join("img00001.jpg").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_capture() {
        let (capture_loop, dir) = build_loop(vec![10], 1_000);
        let (assembler, calls) = recording(false);
        let cancel = capture_loop.cancel.clone();
        let mut capture_loop = capture_loop.with_assembler(assembler);

        cancel.cancel();
        let outcome = capture_loop.run().await.unwrap();

        assert_eq!(outcome, LoopOutcome::Cancelled { frames: 0 });
        assert_eq!(capture_loop.state(), LoopState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_interval() {
        let dir = tempdir().unwrap();
        let store = FrameStore::new(dir.path(), 1_000);
        let source = CaptureSource::new(ScriptedSource::new(vec![10; 10]), store);
        let cancel = CancellationToken::new();
        let mut capture_loop = CaptureLoop::new(source, Duration::from_secs(3600), cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let outcome = capture_loop.run().await.unwrap();
        trigger.await.unwrap();

        assert_eq!(outcome, LoopOutcome::Cancelled { frames: 1 });
        assert_eq!(capture_loop.source().store().used_bytes(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_capture_immediate_then_fixed_delay() {
        let dir = tempdir().unwrap();
        let pulls = Arc::new(Mutex::new(Vec::new()));
        let source = TimedSource {
            pulls: pulls.clone(),
            capture_time: Duration::from_secs(3),
            size: 100,
        };
        let store = FrameStore::new(dir.path(), 250);
        let mut capture_loop = CaptureLoop::new(
            CaptureSource::new(source, store),
            Duration::from_secs(10),
            CancellationToken::new(),
        );

        let start = Instant::now();
        let outcome = capture_loop.run().await.unwrap();

        assert!(matches!(outcome, LoopOutcome::Done { frames: 3, .. }));
        let pulls = pulls.lock().clone();
        assert_eq!(pulls.len(), 3);
        assert_eq!(pulls[0], start);
        // Sleep starts after the previous capture finished
        assert_eq!(pulls[1] - pulls[0], Duration::from_secs(13));
        assert_eq!(pulls[2] - pulls[1], Duration::from_secs(13));
        // No sleep after the capture that exhausted the quota
        assert_eq!(Instant::now() - start, Duration::from_secs(29));
    }
}
