//! One camera: a worker thread running its `StreamConnection`, and the
//! handle consumers use to read frames, query status and control recording.
//!
//! Every consumer call is non-blocking with respect to the worker: reads go
//! through atomics or the frame-buffer lock, and control requests are sent
//! as signals the worker picks up at its next step.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{CamgridConfig, RecordingFormat};
use crate::connection::{ConnectionSettings, ConnectionState, FeedShared, Signal, StreamConnection};
use crate::error::FeedError;
use crate::frame::Frame;
use crate::identity::CameraIdentity;
use crate::ingest::{RtspTransportFactory, StreamEndpoint, TransportFactory};
use crate::recording::{unique_path, Recorder, SinkFactory, Y4mSinkFactory};
use crate::resolver::{AddressResolver, SubnetResolver};
use crate::snapshot;

/// Registry-assigned feed handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(pub u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed-{}", self.0)
    }
}

/// Collaborators shared by every feed of one host.
#[derive(Clone)]
pub struct FeedContext {
    pub resolver: Arc<dyn AddressResolver>,
    pub transports: Arc<dyn TransportFactory>,
    pub sinks: Arc<dyn SinkFactory>,
    pub endpoint: StreamEndpoint,
    pub connection: ConnectionSettings,
    pub record_fps: u32,
    pub recordings_dir: PathBuf,
}

impl FeedContext {
    /// System resolver, RTSP transport and the configured recording format.
    pub fn from_config(cfg: &CamgridConfig) -> Self {
        Self {
            resolver: Arc::new(SubnetResolver::system(cfg.subnet, cfg.probe_timeout)),
            transports: Arc::new(RtspTransportFactory::default()),
            sinks: sink_factory(cfg.recording.format),
            endpoint: cfg.stream.clone(),
            connection: cfg.connection.clone(),
            record_fps: cfg.recording.fps,
            recordings_dir: cfg.recordings_dir.clone(),
        }
    }
}

fn sink_factory(format: RecordingFormat) -> Arc<dyn SinkFactory> {
    match format {
        #[cfg(feature = "rtsp-gstreamer")]
        RecordingFormat::Mp4 => Arc::new(crate::recording::Mp4SinkFactory),
        #[cfg(not(feature = "rtsp-gstreamer"))]
        RecordingFormat::Mp4 => {
            log::warn!("mp4 recording unavailable in this build, writing y4m");
            Arc::new(Y4mSinkFactory)
        }
        RecordingFormat::Y4m => Arc::new(Y4mSinkFactory),
    }
}

/// Point-in-time view of a feed, suitable for a tile caption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub address: Option<Ipv4Addr>,
    pub recording: bool,
    pub since_last_frame: Option<Duration>,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        match self.address {
            Some(address) => write!(f, " | {address}")?,
            None => f.write_str(" | unresolved")?,
        }
        if self.recording {
            f.write_str(" | recording")?;
        }
        Ok(())
    }
}

pub struct CameraFeed {
    id: FeedId,
    identity: CameraIdentity,
    shared: Arc<FeedShared>,
    signals: Sender<Signal>,
    worker: Option<JoinHandle<()>>,
    stale_after: Duration,
}

impl CameraFeed {
    /// Start the feed's worker. The worker begins resolving immediately.
    pub fn spawn(id: FeedId, identity: CameraIdentity, ctx: &FeedContext) -> crate::Result<Self> {
        let recorder = Recorder::new(ctx.sinks.clone(), ctx.record_fps, ctx.recordings_dir.clone());
        let shared = Arc::new(FeedShared::new(recorder));
        let (tx, rx) = mpsc::channel();
        let connection = StreamConnection::new(
            identity.clone(),
            ctx.endpoint.clone(),
            ctx.connection.clone(),
            ctx.resolver.clone(),
            ctx.transports.clone(),
            shared.clone(),
            rx,
        );
        let worker = std::thread::Builder::new()
            .name(format!("camgrid-{}", id))
            .spawn(move || connection.run())?;
        log::info!("{}: started for {}", id, identity.hardware_address());

        Ok(Self {
            id,
            identity,
            shared,
            signals: tx,
            worker: Some(worker),
            stale_after: ctx.connection.stale_after,
        })
    }

    pub fn id(&self) -> FeedId {
        self.id
    }

    pub fn identity(&self) -> &CameraIdentity {
        &self.identity
    }

    /// Latest decoded frame, if any.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.shared.frames.snapshot()
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().is_streaming()
    }

    pub fn resolved_address(&self) -> Option<Ipv4Addr> {
        self.shared.address()
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self.shared.state(),
            address: self.shared.address(),
            recording: self.shared.recorder.is_recording(),
            since_last_frame: self.shared.since_last_read(),
        }
    }

    /// Start recording sized after the current frame. Returns the output
    /// path; already recording returns the open session's path.
    pub fn start_recording(&self) -> crate::Result<PathBuf> {
        let frame = self.current_frame();
        self.shared.recorder.start(frame.as_deref(), &self.file_label())
    }

    /// Finalize the current recording. Idempotent.
    pub fn stop_recording(&self) {
        self.shared.recorder.stop();
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recorder.is_recording()
    }

    /// Start when idle, stop when recording. Returns whether a recording is
    /// now in progress.
    pub fn toggle_recording(&self) -> crate::Result<bool> {
        if self.is_recording() {
            self.stop_recording();
            Ok(false)
        } else {
            self.start_recording().map(|_| true)
        }
    }

    /// Write the current frame as `capture_<address>_<secs>.jpg` in `dir`.
    pub fn capture_snapshot(&self, dir: &Path) -> crate::Result<PathBuf> {
        let frame = self.current_frame().ok_or(FeedError::NoFrameAvailable)?;
        let path = unique_path(dir, "capture", &self.file_label(), "jpg");
        snapshot::write_jpeg(&frame, &path).map_err(|e| FeedError::WriterInitFailed {
            path: path.clone(),
            reason: format!("{e:#}"),
        })?;
        log::info!("{}: snapshot saved to {}", self.id, path.display());
        Ok(path)
    }

    /// Ask the worker to drop the stream and resolve again.
    pub fn request_reconnect(&self) {
        let _ = self.signals.send(Signal::Reconnect);
    }

    /// Watchdog entry point for the host scheduler. A stale streaming feed
    /// is told to reconnect and the staleness is returned; a feed that is
    /// not streaming is told to retry now instead of finishing its backoff.
    pub fn check_connection(&self) -> Option<FeedError> {
        if self.worker.is_none() || self.shared.is_stopping() {
            return None;
        }
        match self.shared.state() {
            ConnectionState::Streaming => {
                let stale = self.shared.check_staleness(self.stale_after)?;
                log::warn!("{}: {}; reconnecting", self.id, stale);
                self.request_reconnect();
                Some(stale)
            }
            ConnectionState::Disconnected => None,
            _ => {
                self.request_reconnect();
                None
            }
        }
    }

    /// Stop the worker, release the stream and finalize any recording.
    /// Blocks until the worker has exited. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.signal_shutdown();
        if worker.join().is_err() {
            log::error!("{}: worker panicked", self.id);
            self.shared.recorder.stop();
        }
    }

    /// Ask the worker to stop without waiting for it.
    pub(crate) fn signal_shutdown(&self) {
        self.shared.request_stop();
        let _ = self.signals.send(Signal::Shutdown);
    }

    /// Recorded and captured files are named after the resolved address,
    /// or the hardware address while unresolved.
    fn file_label(&self) -> String {
        match self.shared.address() {
            Some(address) => address.to_string(),
            None => self.identity.hardware_address().hyphenated(),
        }
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CameraFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFeed")
            .field("id", &self.id)
            .field("hardware_address", &self.identity.hardware_address())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HardwareAddress;
    use crate::ingest::SyntheticConfig;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    struct FixedResolver(Option<Ipv4Addr>);

    impl AddressResolver for FixedResolver {
        fn resolve(&self, target: &HardwareAddress, _cancel: &AtomicBool) -> crate::Result<Ipv4Addr> {
            self.0.ok_or_else(|| FeedError::AddressNotFound(target.to_string()))
        }
    }

    fn context(answer: Option<Ipv4Addr>, dir: &Path) -> FeedContext {
        FeedContext {
            resolver: Arc::new(FixedResolver(answer)),
            transports: Arc::new(RtspTransportFactory {
                synthetic: SyntheticConfig {
                    width: 32,
                    height: 24,
                    fps: 50,
                },
                ..RtspTransportFactory::default()
            }),
            sinks: Arc::new(Y4mSinkFactory),
            endpoint: StreamEndpoint {
                scheme: "stub".to_string(),
                ..StreamEndpoint::default()
            },
            connection: ConnectionSettings {
                resolve_backoff: Duration::from_millis(20),
                ..ConnectionSettings::default()
            },
            record_fps: 15,
            recordings_dir: dir.to_path_buf(),
        }
    }

    fn identity() -> CameraIdentity {
        CameraIdentity::parse("aa-bb-cc-dd-ee-ff", "admin", "p@ss").unwrap()
    }

    fn wait_for_frame(feed: &CameraFeed) -> Arc<Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = feed.current_frame() {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame within 5s");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn streams_and_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Some(Ipv4Addr::new(192, 168, 60, 42)), dir.path());
        let mut feed = CameraFeed::spawn(FeedId(1), identity(), &ctx).unwrap();

        let frame = wait_for_frame(&feed);
        assert_eq!(frame.dimensions(), (32, 24));
        assert!(feed.is_connected());
        assert_eq!(feed.resolved_address(), Some(Ipv4Addr::new(192, 168, 60, 42)));
        assert_eq!(feed.status().to_string(), "streaming | 192.168.60.42");
        assert!(feed.check_connection().is_none());

        feed.shutdown();
        assert_eq!(feed.connection_status(), ConnectionState::Disconnected);
    }

    #[test]
    fn recording_needs_a_frame() {
        let dir = tempfile::tempdir().unwrap();
        let feed = CameraFeed::spawn(FeedId(2), identity(), &context(None, dir.path())).unwrap();
        assert!(matches!(feed.start_recording(), Err(FeedError::NoFrameAvailable)));
        assert!(matches!(
            feed.capture_snapshot(dir.path()),
            Err(FeedError::NoFrameAvailable)
        ));
        assert!(!feed.is_recording());
        assert_eq!(feed.status().to_string().split(" | ").nth(1), Some("unresolved"));
    }

    #[test]
    fn toggle_records_under_the_resolved_address() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Some(Ipv4Addr::new(192, 168, 60, 42)), dir.path());
        let mut feed = CameraFeed::spawn(FeedId(3), identity(), &ctx).unwrap();
        wait_for_frame(&feed);

        assert!(feed.toggle_recording().unwrap());
        assert!(feed.status().recording);
        std::thread::sleep(Duration::from_millis(200));
        assert!(!feed.toggle_recording().unwrap());

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("grab_192.168.60.42_"));
        assert!(files[0].ends_with(".y4m"));
        feed.shutdown();
    }

    #[test]
    fn snapshot_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Some(Ipv4Addr::new(192, 168, 60, 42)), dir.path());
        let feed = CameraFeed::spawn(FeedId(4), identity(), &ctx).unwrap();
        wait_for_frame(&feed);

        let path = feed.capture_snapshot(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("capture_192.168.60.42_"));
        assert!(name.ends_with(".jpg"));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn shutdown_twice_finalizes_recording_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Some(Ipv4Addr::new(192, 168, 60, 42)), dir.path());
        let mut feed = CameraFeed::spawn(FeedId(5), identity(), &ctx).unwrap();
        wait_for_frame(&feed);
        let path = feed.start_recording().unwrap();

        feed.shutdown();
        feed.shutdown();
        assert!(!feed.is_recording());
        assert_eq!(feed.connection_status(), ConnectionState::Disconnected);
        assert!(feed.check_connection().is_none());
        let bytes = std::fs::read(path).unwrap();
        assert!(bytes.starts_with(b"YUV4MPEG2 W32 H24 F15:1"));
    }
}
