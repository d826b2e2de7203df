//! On-demand recording of a feed to a container file.
//!
//! A `Recorder` belongs to one feed and guards its optional
//! `RecordingSession` with its own lock, separate from the frame buffer
//! lock, so a slow disk write never delays live frames and a reconnect
//! never touches a write in progress.
//!
//! Sessions sample the incoming stream at a fixed rate: a frame is written
//! only when at least `1 / fps` has passed since the last written frame.
//! The source rate is unknown and variable, so this is the only thing that
//! fixes the recorded rate.

pub mod y4m;
#[cfg(feature = "rtsp-gstreamer")]
pub mod mp4;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::FeedError;
use crate::frame::Frame;

#[cfg(feature = "rtsp-gstreamer")]
pub use mp4::Mp4SinkFactory;
pub use y4m::Y4mSinkFactory;

/// Output side of the media library: "write frame to file".
pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> anyhow::Result<()>;

    /// Flush and close the file.
    fn finish(self: Box<Self>) -> anyhow::Result<()>;
}

/// Creates sinks for a fixed geometry and frame rate.
pub trait SinkFactory: Send + Sync {
    /// File extension of the container, without the dot.
    fn extension(&self) -> &'static str;

    fn create(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> anyhow::Result<Box<dyn FrameSink>>;
}

/// What a finished session produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames_written: u64,
}

/// One open output file. Never reused after `close`.
pub struct RecordingSession {
    sink: Box<dyn FrameSink>,
    path: PathBuf,
    width: u32,
    height: u32,
    interval: Duration,
    last_write: Option<Instant>,
    frames_written: u64,
}

impl RecordingSession {
    /// Open a sink sized after `sample`.
    pub fn open(
        factory: &dyn SinkFactory,
        path: PathBuf,
        sample: &Frame,
        fps: u32,
    ) -> crate::Result<Self> {
        let (width, height) = sample.dimensions();
        let sink = factory
            .create(&path, width, height, fps)
            .map_err(|e| FeedError::WriterInitFailed {
                path: path.clone(),
                reason: format!("{e:#}"),
            })?;
        Ok(Self {
            sink,
            path,
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            last_write: None,
            frames_written: 0,
        })
    }

    /// Write `frame` if the sampling interval has elapsed at `now`.
    /// Returns whether the frame was written.
    pub fn offer(&mut self, frame: &Frame, now: Instant) -> bool {
        if let Some(last) = self.last_write {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        if frame.dimensions() != (self.width, self.height) {
            log::warn!(
                "recording {}: skipping {}x{} frame, session is {}x{}",
                self.path.display(),
                frame.width,
                frame.height,
                self.width,
                self.height
            );
            return false;
        }
        match self.sink.write(frame) {
            Ok(()) => {
                self.last_write = Some(now);
                self.frames_written += 1;
                true
            }
            Err(err) => {
                log::warn!("recording {}: write failed: {:#}", self.path.display(), err);
                false
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) -> RecordingSummary {
        let summary = RecordingSummary {
            path: self.path,
            frames_written: self.frames_written,
        };
        if let Err(err) = self.sink.finish() {
            log::error!("recording {}: finalize failed: {:#}", summary.path.display(), err);
        }
        summary
    }
}

/// Per-feed recording state.
pub struct Recorder {
    session: Mutex<Option<RecordingSession>>,
    factory: Arc<dyn SinkFactory>,
    fps: u32,
    dir: PathBuf,
}

impl Recorder {
    pub fn new(factory: Arc<dyn SinkFactory>, fps: u32, dir: impl Into<PathBuf>) -> Self {
        Self {
            session: Mutex::new(None),
            factory,
            fps: fps.max(1),
            dir: dir.into(),
        }
    }

    /// Start a session sized after `sample`, writing to
    /// `grab_<label>_<unix secs>.<ext>`. Already recording is not an error;
    /// the open session's path is returned. The sink is created without
    /// holding the session lock, so frames keep flowing meanwhile.
    pub fn start(&self, sample: Option<&Frame>, label: &str) -> crate::Result<PathBuf> {
        if let Some(session) = self.lock().as_ref() {
            return Ok(session.path().to_path_buf());
        }
        let sample = sample.ok_or(FeedError::NoFrameAvailable)?;
        let path = unique_path(&self.dir, "grab", label, self.factory.extension());
        let session = RecordingSession::open(self.factory.as_ref(), path.clone(), sample, self.fps)?;

        let mut guard = self.lock();
        if let Some(existing) = guard.as_ref() {
            // Another caller won the race.
            let existing = existing.path().to_path_buf();
            drop(guard);
            let summary = session.close();
            if let Err(err) = std::fs::remove_file(&summary.path) {
                log::debug!("discard {}: {}", summary.path.display(), err);
            }
            return Ok(existing);
        }
        *guard = Some(session);
        drop(guard);
        log::info!(
            "recording started: {} ({}x{} @ {} fps)",
            path.display(),
            sample.width,
            sample.height,
            self.fps
        );
        Ok(path)
    }

    /// Finalize and close the current session. Idempotent.
    pub fn stop(&self) -> Option<RecordingSummary> {
        let session = self.lock().take()?;
        let summary = session.close();
        log::info!(
            "recording stopped: {} ({} frames)",
            summary.path.display(),
            summary.frames_written
        );
        Some(summary)
    }

    /// Offer a frame to the active session, if any.
    pub fn feed(&self, frame: &Frame) -> bool {
        self.feed_at(frame, Instant::now())
    }

    pub fn feed_at(&self, frame: &Frame, now: Instant) -> bool {
        match self.lock().as_mut() {
            Some(session) => session.offer(frame, now),
            None => false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RecordingSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `<dir>/<prefix>_<label>_<secs>.<ext>`, with a counter appended when a
/// file of that name already exists (two sessions in the same second).
pub(crate) fn unique_path(dir: &Path, prefix: &str, label: &str, ext: &str) -> PathBuf {
    let stem = format!("{}_{}_{}", prefix, label, unix_secs());
    let mut path = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}-{n}.{ext}"));
        n += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct Counts {
        writes: AtomicUsize,
        finishes: AtomicUsize,
    }

    struct CountingSink(Arc<Counts>);

    impl FrameSink for CountingSink {
        fn write(&mut self, _frame: &Frame) -> anyhow::Result<()> {
            self.0.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(self: Box<Self>) -> anyhow::Result<()> {
            self.0.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory(Arc<Counts>);

    impl SinkFactory for CountingFactory {
        fn extension(&self) -> &'static str {
            "bin"
        }

        fn create(&self, _: &Path, _: u32, _: u32, _: u32) -> anyhow::Result<Box<dyn FrameSink>> {
            Ok(Box::new(CountingSink(self.0.clone())))
        }
    }

    /// Blocks inside `create` until released.
    struct GatedFactory {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SinkFactory for GatedFactory {
        fn extension(&self) -> &'static str {
            "bin"
        }

        fn create(&self, _: &Path, _: u32, _: u32, _: u32) -> anyhow::Result<Box<dyn FrameSink>> {
            self.entered.lock().unwrap().send(())?;
            self.release.lock().unwrap().recv()?;
            Ok(Box::new(CountingSink(Arc::new(Counts::default()))))
        }
    }

    struct BrokenFactory;

    impl SinkFactory for BrokenFactory {
        fn extension(&self) -> &'static str {
            "bin"
        }

        fn create(&self, _: &Path, _: u32, _: u32, _: u32) -> anyhow::Result<Box<dyn FrameSink>> {
            anyhow::bail!("codec unsupported")
        }
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![7; (width * height * 3) as usize], width, height).unwrap()
    }

    fn recorder(fps: u32) -> (Recorder, Arc<Counts>, tempfile::TempDir) {
        let counts = Arc::new(Counts::default());
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(Arc::new(CountingFactory(counts.clone())), fps, dir.path());
        (recorder, counts, dir)
    }

    #[test]
    fn start_without_frame_is_rejected() {
        let (recorder, counts, _dir) = recorder(10);
        let err = recorder.start(None, "cam").unwrap_err();
        assert!(matches!(err, FeedError::NoFrameAvailable));
        assert!(!recorder.is_recording());
        assert_eq!(counts.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn writer_failure_leaves_recording_off() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(Arc::new(BrokenFactory), 10, dir.path());
        let err = recorder.start(Some(&frame(4, 4)), "cam").unwrap_err();
        assert!(matches!(err, FeedError::WriterInitFailed { .. }));
        assert!(!recorder.is_recording());
    }

    #[test]
    fn feed_is_rate_limited() {
        let (recorder, counts, _dir) = recorder(10);
        let sample = frame(4, 4);
        recorder.start(Some(&sample), "cam").unwrap();

        let t0 = Instant::now();
        assert!(recorder.feed_at(&sample, t0));
        assert!(!recorder.feed_at(&sample, t0 + Duration::from_millis(30)));
        assert!(!recorder.feed_at(&sample, t0 + Duration::from_millis(99)));
        assert!(recorder.feed_at(&sample, t0 + Duration::from_millis(100)));
        assert!(recorder.feed_at(&sample, t0 + Duration::from_millis(250)));
        assert_eq!(counts.writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn frames_of_other_geometry_are_skipped() {
        let (recorder, counts, _dir) = recorder(10);
        recorder.start(Some(&frame(4, 4)), "cam").unwrap();
        assert!(!recorder.feed(&frame(8, 4)));
        assert_eq!(counts.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_is_idempotent_and_finalizes_once() {
        let (recorder, counts, _dir) = recorder(10);
        recorder.start(Some(&frame(4, 4)), "cam").unwrap();
        recorder.feed(&frame(4, 4));

        let summary = recorder.stop().expect("session was open");
        assert_eq!(summary.frames_written, 1);
        assert!(recorder.stop().is_none());
        assert_eq!(counts.finishes.load(Ordering::SeqCst), 1);
        assert!(!recorder.feed(&frame(4, 4)));
    }

    #[test]
    fn restart_opens_a_new_file() {
        let (recorder, _counts, dir) = recorder(10);
        let first = recorder.start(Some(&frame(4, 4)), "cam").unwrap();
        std::fs::write(&first, b"").unwrap();
        recorder.stop();
        let second = recorder.start(Some(&frame(4, 4)), "cam").unwrap();
        assert_ne!(first, second);
        assert!(second.starts_with(dir.path()));
    }

    #[test]
    fn slow_sink_creation_does_not_hold_the_session_lock() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let dir = tempfile::tempdir().unwrap();
        let factory = GatedFactory {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let recorder = Arc::new(Recorder::new(Arc::new(factory), 10, dir.path()));

        let opener = {
            let recorder = recorder.clone();
            std::thread::spawn(move || recorder.start(Some(&frame(4, 4)), "cam"))
        };
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(recorder.session.try_lock().is_ok());
        assert!(!recorder.feed(&frame(4, 4)));
        assert!(!recorder.is_recording());

        release_tx.send(()).unwrap();
        let path = opener.join().unwrap().unwrap();
        assert!(recorder.is_recording());
        assert!(path.starts_with(dir.path()));
    }
}
