//! Error taxonomy for camera feeds.
//!
//! Per-feed I/O failures (`AddressNotFound` through `StaleConnection`) are
//! recovered inside the feed's own worker and only ever reported through
//! status and logs. The recording variants are returned to the caller that
//! asked for a recording. `ConfigLoadCorrupt` is the only error escalated at
//! startup.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The subnet scan finished without a neighbor entry for the address.
    #[error("no network address found for {0}")]
    AddressNotFound(String),

    /// The transport could not open the stream at the resolved address.
    #[error("failed to open stream at {address}: {reason}")]
    ConnectionOpenFailed { address: String, reason: String },

    /// A read returned an error or an empty frame.
    #[error("stream read failed: {0}")]
    StreamReadFailed(String),

    /// No successful read within the staleness threshold.
    #[error("no frame received for {elapsed_ms} ms")]
    StaleConnection { elapsed_ms: u64 },

    /// Recording or snapshot requested before any frame was decoded.
    #[error("no frame available yet")]
    NoFrameAvailable,

    /// The recording sink could not be created.
    #[error("failed to initialise writer for {path}: {reason}")]
    WriterInitFailed { path: PathBuf, reason: String },

    /// The persisted store exists but cannot be parsed.
    #[error("camera store {path} is corrupt: {reason}")]
    ConfigLoadCorrupt { path: PathBuf, reason: String },

    /// A hardware address or credential set that cannot be used.
    #[error("invalid camera identity: {0}")]
    InvalidIdentity(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeedError {
    /// Failures the feed worker retries on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FeedError::AddressNotFound(_)
                | FeedError::ConnectionOpenFailed { .. }
                | FeedError::StreamReadFailed(_)
                | FeedError::StaleConnection { .. }
        )
    }
}
