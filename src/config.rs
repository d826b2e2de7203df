use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ConnectionSettings;
use crate::ingest::StreamEndpoint;
use crate::resolver::Subnet;

const DEFAULT_STORE_PATH: &str = "cameras.dat";
const DEFAULT_OUTPUT_DIR: &str = ".";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 400;
const DEFAULT_RECORD_FPS: u32 = 15;
const DEFAULT_WATCHDOG_MS: u64 = 60_000;

#[derive(Debug, Deserialize, Default)]
struct CamgridConfigFile {
    store_path: Option<PathBuf>,
    recordings_dir: Option<PathBuf>,
    snapshots_dir: Option<PathBuf>,
    subnet: Option<SubnetConfigFile>,
    stream: Option<StreamConfigFile>,
    recording: Option<RecordingConfigFile>,
    connection: Option<ConnectionConfigFile>,
    watchdog_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SubnetConfigFile {
    base: Option<String>,
    first: Option<u8>,
    last: Option<u8>,
    probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    scheme: Option<String>,
    port: Option<u16>,
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    fps: Option<u32>,
    format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConnectionConfigFile {
    stale_after_ms: Option<u64>,
    resolve_backoff_ms: Option<u64>,
    open_backoff_ms: Option<u64>,
    read_failure_backoff_ms: Option<u64>,
    reconnect_pause_ms: Option<u64>,
    reresolve_after_failures: Option<u32>,
}

/// Container written by recording sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingFormat {
    /// Uncompressed YUV4MPEG2; always available.
    Y4m,
    /// H.264 in MP4; needs the `rtsp-gstreamer` feature.
    Mp4,
}

impl Default for RecordingFormat {
    fn default() -> Self {
        if cfg!(feature = "rtsp-gstreamer") {
            RecordingFormat::Mp4
        } else {
            RecordingFormat::Y4m
        }
    }
}

impl std::str::FromStr for RecordingFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "y4m" => Ok(RecordingFormat::Y4m),
            "mp4" => Ok(RecordingFormat::Mp4),
            other => Err(anyhow!("unknown recording format {other:?} (expected y4m or mp4)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CamgridConfig {
    pub store_path: PathBuf,
    pub recordings_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub subnet: Subnet,
    pub probe_timeout: Duration,
    pub stream: StreamEndpoint,
    pub recording: RecordingSettings,
    pub connection: ConnectionSettings,
    pub watchdog_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub fps: u32,
    pub format: RecordingFormat,
}

impl Default for CamgridConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            recordings_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            snapshots_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            subnet: Subnet::default(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            stream: StreamEndpoint::default(),
            recording: RecordingSettings {
                fps: DEFAULT_RECORD_FPS,
                format: RecordingFormat::default(),
            },
            connection: ConnectionSettings::default(),
            watchdog_interval: Duration::from_millis(DEFAULT_WATCHDOG_MS),
        }
    }
}

impl CamgridConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMGRID_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamgridConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let subnet_file = file.subnet.unwrap_or_default();
        let base = match subnet_file.base.as_deref() {
            Some(base) => parse_subnet_base(base)?,
            None => defaults.subnet,
        };
        let subnet = Subnet::new(
            base.base(),
            subnet_file.first.unwrap_or(base.first()),
            subnet_file.last.unwrap_or(base.last()),
        )
        .map_err(|e| anyhow!("invalid subnet: {e}"))?;

        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamEndpoint {
            scheme: stream_file.scheme.unwrap_or(defaults.stream.scheme),
            port: stream_file.port.unwrap_or(defaults.stream.port),
            path: stream_file.path.unwrap_or(defaults.stream.path),
        };

        let recording_file = file.recording.unwrap_or_default();
        let recording = RecordingSettings {
            fps: recording_file.fps.unwrap_or(defaults.recording.fps),
            format: match recording_file.format.as_deref() {
                Some(format) => format.parse()?,
                None => defaults.recording.format,
            },
        };

        let conn_file = file.connection.unwrap_or_default();
        let conn_defaults = defaults.connection;
        let ms_or = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let connection = ConnectionSettings {
            stale_after: ms_or(conn_file.stale_after_ms, conn_defaults.stale_after),
            resolve_backoff: ms_or(conn_file.resolve_backoff_ms, conn_defaults.resolve_backoff),
            open_backoff: ms_or(conn_file.open_backoff_ms, conn_defaults.open_backoff),
            read_failure_backoff: ms_or(
                conn_file.read_failure_backoff_ms,
                conn_defaults.read_failure_backoff,
            ),
            reconnect_pause: ms_or(conn_file.reconnect_pause_ms, conn_defaults.reconnect_pause),
            reresolve_after_failures: conn_file
                .reresolve_after_failures
                .unwrap_or(conn_defaults.reresolve_after_failures),
        };

        Ok(Self {
            store_path: file.store_path.unwrap_or(defaults.store_path),
            recordings_dir: file.recordings_dir.unwrap_or(defaults.recordings_dir),
            snapshots_dir: file.snapshots_dir.unwrap_or(defaults.snapshots_dir),
            subnet,
            probe_timeout: ms_or(subnet_file.probe_timeout_ms, defaults.probe_timeout),
            stream,
            recording,
            connection,
            watchdog_interval: ms_or(file.watchdog_interval_ms, defaults.watchdog_interval),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("CAMGRID_STORE") {
            self.store_path = PathBuf::from(path);
        }
        if let Some(dir) = env_nonempty("CAMGRID_RECORDINGS_DIR") {
            self.recordings_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("CAMGRID_SNAPSHOTS_DIR") {
            self.snapshots_dir = PathBuf::from(dir);
        }
        if let Some(base) = env_nonempty("CAMGRID_SUBNET") {
            let parsed = parse_subnet_base(&base)?;
            self.subnet = Subnet::new(parsed.base(), self.subnet.first(), self.subnet.last())
                .map_err(|e| anyhow!("invalid subnet: {e}"))?;
        }
        if let Some(scheme) = env_nonempty("CAMGRID_STREAM_SCHEME") {
            self.stream.scheme = scheme;
        }
        if let Some(ms) = env_u64("CAMGRID_PROBE_TIMEOUT_MS")? {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(fps) = env_nonempty("CAMGRID_RECORD_FPS") {
            self.recording.fps = fps
                .parse()
                .map_err(|_| anyhow!("CAMGRID_RECORD_FPS must be an integer frame rate"))?;
        }
        if let Some(ms) = env_u64("CAMGRID_STALE_AFTER_MS")? {
            self.connection.stale_after = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CAMGRID_WATCHDOG_MS")? {
            self.watchdog_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.stream.scheme = self.stream.scheme.trim().to_ascii_lowercase();
        if self.stream.scheme.is_empty() {
            return Err(anyhow!("stream scheme must not be empty"));
        }
        self.stream.path = self.stream.path.trim_start_matches('/').to_string();
        if self.recording.fps == 0 {
            return Err(anyhow!("recording fps must be greater than zero"));
        }
        if self.recording.format == RecordingFormat::Mp4 && !cfg!(feature = "rtsp-gstreamer") {
            return Err(anyhow!(
                "mp4 recording requires the rtsp-gstreamer feature; use y4m"
            ));
        }
        if self.connection.stale_after.is_zero() {
            return Err(anyhow!("staleness threshold must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(anyhow!("probe timeout must be greater than zero"));
        }
        if self.watchdog_interval.is_zero() {
            return Err(anyhow!("watchdog interval must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamgridConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_subnet_base(value: &str) -> Result<Subnet> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid subnet base {value:?}: {e}"))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    env_nonempty(key)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| anyhow!("{key} must be an integer number of milliseconds"))
        })
        .transpose()
}
