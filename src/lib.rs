//! camgrid: always-on IP camera feeds addressed by hardware address.
//!
//! Cameras are configured by MAC address and credentials. Each feed runs its
//! own worker that finds the camera on the local subnet, opens its RTSP
//! stream, keeps the latest decoded frame for consumers and reconnects by
//! itself when the stream fails or goes quiet.
//!
//! # Module Structure
//!
//! - `identity`: hardware addresses and credentials
//! - `resolver`: MAC to IPv4 resolution by subnet scan and neighbor table
//! - `ingest`: stream URLs and the transport seam (synthetic and GStreamer)
//! - `frame`: decoded frames and the single-slot frame buffer
//! - `recording`: rate-limited recording sessions and file sinks
//! - `connection`: the per-feed connection state machine
//! - `feed`: camera feed handles and their worker threads
//! - `registry`: the persisted camera list and the live feed set
//! - `config`: host configuration from file and environment

pub mod config;
pub mod connection;
pub mod error;
pub mod feed;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod recording;
pub mod registry;
pub mod resolver;
pub mod snapshot;
pub mod ui;

pub use config::{CamgridConfig, RecordingFormat};
pub use connection::{ConnectionSettings, ConnectionState, StreamConnection};
pub use error::{FeedError, Result};
pub use feed::{CameraFeed, FeedContext, FeedId, FeedStatus};
pub use frame::{Frame, FrameBuffer};
pub use identity::{CameraIdentity, HardwareAddress};
pub use ingest::{RtspTransportFactory, StreamEndpoint, StreamTransport, StreamUrl, TransportFactory};
pub use recording::{Recorder, RecordingSession, SinkFactory, Y4mSinkFactory};
pub use registry::{FeedRecord, FeedRegistry, FeedStore};
pub use resolver::{AddressResolver, Subnet, SubnetResolver};
