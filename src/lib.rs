//! # OpenNDI
//!
//! Zero-config live video link between a capture host and one or more
//! receivers on the same LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐                 ┌──────────────────────────────┐
//! │           SENDER             │                 │           RECEIVER           │
//! │                              │   multicast     │                              │
//! │  Advertiser (discovery) ◄────┼─── QUERY ───────┼──── find(_openndi._udp)      │
//! │                         ─────┼─── ANSWER ─────►│                              │
//! │                              │                 │                              │
//! │  ControlListener (TCP) ◄─────┼─── HELLO ───────┼──── connect(control addr)    │
//! │                         ─────┼─── ACCEPT ─────►│     NegotiatedConfig         │
//! │                              │                 │                              │
//! │  DatagramSender ─────────────┼─── [seq|ack|flags|payload] ──► DatagramReceiver│
//! │    or MediaBridge (ffmpeg) ──┼─── MPEG-TS over UDP ─────────► FrameSink       │
//! └──────────────────────────────┘                 └──────────────────────────────┘
//! ```
//!
//! A [`session::StreamSession`] ties the pieces together and exposes the
//! session state machine `Idle -> Negotiating -> Streaming -> {Stopped, Failed}`.

pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod protocol;
pub mod session;
pub mod shutdown;

pub use error::{Error, NetworkError, Result};

/// Application-wide constants
pub mod constants {
    /// DNS-SD style service type advertised by senders
    pub const SERVICE_TYPE: &str = "_openndi._udp";

    /// Default instance name of an advertised sender
    pub const DEFAULT_INSTANCE_NAME: &str = "openndi-sender";

    /// Default TCP port of the control handshake
    pub const DEFAULT_CONTROL_PORT: u16 = 9000;

    /// Default UDP port of the data channel
    pub const DEFAULT_DATA_PORT: u16 = 5000;

    /// Default discovery multicast group
    pub const DEFAULT_DISCOVERY_GROUP: [u8; 4] = [239, 255, 77, 77];

    /// Default discovery port
    pub const DEFAULT_DISCOVERY_PORT: u16 = 9353;

    /// Default resolution timeout used by the CLIs
    pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5000;

    /// Default sender cadence (~30 fps)
    pub const DEFAULT_SEND_INTERVAL_MS: u64 = 33;

    /// Default synthetic payload size
    pub const DEFAULT_PAYLOAD_SIZE: usize = 1024;

    /// Default grace period before a media bridge is force-killed
    pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2000;
}
