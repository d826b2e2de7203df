//! Stream connection state machine.
//!
//! One `StreamConnection` drives one camera through
//! `Disconnected -> Resolving -> Connecting -> Streaming`, falling back to
//! `Failed` (a backoff pause) and then `Resolving` whenever opening or
//! reading fails or the stream goes quiet for longer than the staleness
//! threshold. Every call to [`StreamConnection::step`] performs exactly one
//! transition, so the worker loop is just `while !terminated { step() }`
//! and tests can drive the machine one transition at a time.
//!
//! State that consumers poll from other threads lives in [`FeedShared`]:
//! atomics for the state, address and last-read time, plus the two locked
//! slots (latest frame, recording). Requests from consumers arrive as
//! [`Signal`]s and are acted on at the worker's next step.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::FeedError;
use crate::frame::{Frame, FrameBuffer};
use crate::identity::CameraIdentity;
use crate::ingest::{StreamEndpoint, StreamTransport, StreamUrl, TransportFactory};
use crate::recording::Recorder;
use crate::resolver::AddressResolver;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Resolving = 1,
    Connecting = 2,
    Streaming = 3,
    /// Backing off after a failure; `Resolving` follows.
    Failed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Resolving,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Streaming,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Failed => "reconnecting",
        }
    }

    pub fn is_streaming(&self) -> bool {
        *self == ConnectionState::Streaming
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests from consumers to the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Reconnect,
    Shutdown,
}

/// Timing knobs for one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Longest gap between successful reads before a streaming connection
    /// is considered dead.
    pub stale_after: Duration,
    pub resolve_backoff: Duration,
    pub open_backoff: Duration,
    pub read_failure_backoff: Duration,
    /// Pause between releasing a stream on request and resolving again.
    pub reconnect_pause: Duration,
    /// Consecutive failures after which the cached address is dropped and
    /// the subnet is scanned again.
    pub reresolve_after_failures: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10),
            resolve_backoff: Duration::from_secs(3),
            open_backoff: Duration::from_secs(2),
            read_failure_backoff: Duration::from_millis(400),
            reconnect_pause: Duration::from_secs(1),
            reresolve_after_failures: 3,
        }
    }
}

/// Per-feed state shared between the worker and consumers.
pub struct FeedShared {
    state: AtomicU8,
    /// IPv4 address as `u32`; zero while unresolved.
    address: AtomicU32,
    /// Milliseconds since `epoch`, plus one; zero before the first read.
    last_read_ms: AtomicU64,
    stop: AtomicBool,
    epoch: Instant,
    pub frames: FrameBuffer,
    pub recorder: Recorder,
}

impl FeedShared {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            address: AtomicU32::new(0),
            last_read_ms: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            epoch: Instant::now(),
            frames: FrameBuffer::new(),
            recorder,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        match self.address.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Ipv4Addr::from(raw)),
        }
    }

    fn set_address(&self, address: Option<Ipv4Addr>) {
        self.address
            .store(address.map(u32::from).unwrap_or(0), Ordering::SeqCst);
    }

    fn mark_read(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64 + 1;
        self.last_read_ms.store(ms, Ordering::SeqCst);
    }

    /// Time since the last successful read (or since the stream opened).
    pub fn since_last_read(&self) -> Option<Duration> {
        match self.last_read_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(
                self.epoch
                    .elapsed()
                    .saturating_sub(Duration::from_millis(ms - 1)),
            ),
        }
    }

    /// Watchdog query. Flags a streaming connection whose last read is older
    /// than `threshold`; performs no I/O.
    pub fn check_staleness(&self, threshold: Duration) -> Option<FeedError> {
        if self.state() != ConnectionState::Streaming {
            return None;
        }
        let elapsed = self.since_last_read()?;
        (elapsed > threshold).then(|| FeedError::StaleConnection {
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Cancellation flag handed to the resolver so a scan ends on shutdown.
    pub(crate) fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }
}

/// The connection state machine for one camera.
pub struct StreamConnection {
    identity: CameraIdentity,
    endpoint: StreamEndpoint,
    settings: ConnectionSettings,
    resolver: Arc<dyn AddressResolver>,
    transports: Arc<dyn TransportFactory>,
    shared: Arc<FeedShared>,
    signals: Receiver<Signal>,
    transport: Option<Box<dyn StreamTransport>>,
    url: Option<StreamUrl>,
    reconnect_requested: bool,
    consecutive_failures: u32,
    backoff: Duration,
    last_error: Option<FeedError>,
    terminated: bool,
}

impl StreamConnection {
    pub fn new(
        identity: CameraIdentity,
        endpoint: StreamEndpoint,
        settings: ConnectionSettings,
        resolver: Arc<dyn AddressResolver>,
        transports: Arc<dyn TransportFactory>,
        shared: Arc<FeedShared>,
        signals: Receiver<Signal>,
    ) -> Self {
        Self {
            identity,
            endpoint,
            settings,
            resolver,
            transports,
            shared,
            signals,
            transport: None,
            url: None,
            reconnect_requested: false,
            consecutive_failures: 0,
            backoff: Duration::ZERO,
            last_error: None,
            terminated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The most recent failure, kept until replaced.
    pub fn last_error(&self) -> Option<&FeedError> {
        self.last_error.as_ref()
    }

    /// Worker body: step until shut down.
    pub fn run(mut self) {
        while !self.terminated {
            self.step();
        }
        log::debug!("{}: worker finished", self.identity.hardware_address());
    }

    /// Perform one transition and return the resulting state.
    pub fn step(&mut self) -> ConnectionState {
        if self.terminated {
            return ConnectionState::Disconnected;
        }
        self.drain_signals();
        if self.shared.is_stopping() {
            self.shutdown();
            return self.state();
        }
        match self.state() {
            ConnectionState::Disconnected => self.begin(),
            ConnectionState::Resolving => self.resolve(),
            ConnectionState::Connecting => self.connect(),
            ConnectionState::Streaming => self.stream(),
            ConnectionState::Failed => self.recover(),
        }
        self.state()
    }

    /// Release the stream, finalize any recording and stop. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.request_stop();
        self.release();
        if let Some(summary) = self.shared.recorder.stop() {
            log::info!(
                "{}: recording {} closed on shutdown",
                self.identity.hardware_address(),
                summary.path.display()
            );
        }
        if !self.terminated {
            log::info!("{}: disconnected", self.identity.hardware_address());
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.terminated = true;
    }

    /// Disconnected -> Resolving.
    fn begin(&mut self) {
        log::debug!("{}: starting", self.identity.hardware_address());
        self.shared.set_state(ConnectionState::Resolving);
    }

    /// Resolving -> Connecting once an address is known and the URL built;
    /// otherwise wait and stay in Resolving.
    fn resolve(&mut self) {
        // Already on the way to a new connection.
        self.reconnect_requested = false;
        let hardware_address = self.identity.hardware_address();

        let address = match self.shared.address() {
            Some(address) => address,
            None => match self.resolver.resolve(&hardware_address, self.shared.stop_flag()) {
                Ok(address) => {
                    log::info!("{}: resolved to {}", hardware_address, address);
                    self.shared.set_address(Some(address));
                    address
                }
                Err(err) => {
                    if self.shared.is_stopping() {
                        return;
                    }
                    log::debug!(
                        "{}: {}; retrying in {:?}",
                        hardware_address,
                        err,
                        self.settings.resolve_backoff
                    );
                    self.last_error = Some(err);
                    self.wait(self.settings.resolve_backoff);
                    return;
                }
            },
        };

        match StreamUrl::build(&self.endpoint, &self.identity, address) {
            Ok(url) => {
                self.url = Some(url);
                self.shared.set_state(ConnectionState::Connecting);
            }
            Err(err) => {
                log::error!("{}: {}", hardware_address, err);
                self.last_error = Some(err);
                self.wait(self.settings.resolve_backoff);
            }
        }
    }

    /// Connecting -> Streaming when the transport opens, Failed otherwise.
    fn connect(&mut self) {
        let Some(url) = self.url.clone() else {
            self.shared.set_state(ConnectionState::Resolving);
            return;
        };
        match self.transports.open(&url) {
            Ok(transport) => {
                // Requests queued while resolving or opening are satisfied
                // by this connection.
                self.drain_signals();
                self.reconnect_requested = false;
                self.transport = Some(transport);
                self.shared.mark_read();
                self.shared.set_state(ConnectionState::Streaming);
                log::info!("{}: streaming from {}", self.identity.hardware_address(), url);
            }
            Err(err) => self.fail(
                FeedError::ConnectionOpenFailed {
                    address: url.address().to_string(),
                    reason: format!("{err:#}"),
                },
                self.settings.open_backoff,
            ),
        }
    }

    /// One read while Streaming. A frame keeps the state; a failed or empty
    /// read, a stale stream or a reconnect request leaves it.
    fn stream(&mut self) {
        if std::mem::take(&mut self.reconnect_requested) {
            log::info!("{}: reconnect requested", self.identity.hardware_address());
            self.release();
            self.wait(self.settings.reconnect_pause);
            self.shared.set_state(ConnectionState::Resolving);
            return;
        }
        if let Some(stale) = self.shared.check_staleness(self.settings.stale_after) {
            self.fail(stale, self.settings.read_failure_backoff);
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            self.shared.set_state(ConnectionState::Resolving);
            return;
        };
        match transport.read_frame() {
            Ok(Some(frame)) if !frame.is_empty() => self.deliver(frame),
            Ok(Some(_)) => self.fail(
                FeedError::StreamReadFailed("empty frame".to_string()),
                self.settings.read_failure_backoff,
            ),
            // Nothing yet; a stream that stays silent is caught as stale.
            Ok(None) => {}
            Err(err) => self.fail(
                FeedError::StreamReadFailed(format!("{err:#}")),
                self.settings.read_failure_backoff,
            ),
        }
    }

    /// Failed -> Resolving after the pending backoff.
    fn recover(&mut self) {
        self.wait(self.backoff);
        if !self.shared.is_stopping() {
            self.shared.set_state(ConnectionState::Resolving);
        }
    }

    fn deliver(&mut self, frame: Frame) {
        self.consecutive_failures = 0;
        let frame = Arc::new(frame);
        self.shared.frames.publish(frame.clone());
        self.shared.mark_read();
        self.shared.recorder.feed(&frame);
    }

    fn fail(&mut self, err: FeedError, backoff: Duration) {
        let hardware_address = self.identity.hardware_address();
        log::warn!("{}: {}", hardware_address, err);
        self.release();
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.settings.reresolve_after_failures.max(1) {
            log::info!(
                "{}: {} consecutive failures, scanning for a new address",
                hardware_address,
                self.consecutive_failures
            );
            self.shared.set_address(None);
            self.url = None;
            self.consecutive_failures = 0;
        }
        self.last_error = Some(err);
        self.backoff = backoff;
        self.shared.set_state(ConnectionState::Failed);
    }

    fn release(&mut self) {
        if self.transport.take().is_some() {
            log::debug!("{}: stream released", self.identity.hardware_address());
        }
    }

    fn drain_signals(&mut self) {
        loop {
            match self.signals.try_recv() {
                Ok(Signal::Reconnect) => self.reconnect_requested = true,
                Ok(Signal::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.shared.request_stop();
                    return;
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }

    /// Sleep for `duration`, waking early on any signal.
    fn wait(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        match self.signals.recv_timeout(duration) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => self.shared.request_stop(),
            Ok(Signal::Reconnect) | Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.release();
    }
}
