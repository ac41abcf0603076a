//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Service discovery
    pub discovery: DiscoveryConfig,

    /// Control handshake
    pub control: ControlConfig,

    /// Datagram stream
    pub stream: StreamConfig,

    /// Capture device
    pub capture: CaptureConfig,

    /// External encoder/decoder process
    pub media: MediaConfig,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service type queried and advertised
    pub service_type: String,

    /// Instance name announced by the advertiser
    pub instance_name: String,

    /// Query destination; a multicast group or a unicast host
    pub group: Ipv4Addr,

    /// Discovery UDP port
    pub port: u16,

    /// Local interface the advertiser binds
    pub bind_address: Ipv4Addr,

    /// Re-send interval of an unanswered query
    pub query_interval_ms: u64,

    /// Multicast TTL (1 = link-local)
    pub multicast_ttl: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
            group: Ipv4Addr::from(DEFAULT_DISCOVERY_GROUP),
            port: DEFAULT_DISCOVERY_PORT,
            bind_address: Ipv4Addr::UNSPECIFIED,
            query_interval_ms: 250,
            multicast_ttl: 1,
        }
    }
}

impl DiscoveryConfig {
    pub fn query_target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms.max(1))
    }
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Listener bind address (offering side)
    pub bind_address: String,

    /// Well-known handshake port
    pub port: u16,

    /// Upper bound on dial + message exchange
    pub handshake_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_CONTROL_PORT,
            handshake_timeout_ms: 5000,
        }
    }
}

impl ControlConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Datagram stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Data port proposed by receivers or assigned by the offering side
    pub data_port: u16,

    /// Sender cadence
    pub send_interval_ms: u64,

    /// Size of synthetic payloads
    pub payload_size: usize,

    /// Largest datagram the receiver accepts
    pub max_datagram_size: usize,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR
    pub reuse_addr: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            data_port: DEFAULT_DATA_PORT,
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            max_datagram_size: crate::protocol::MAX_DATAGRAM_SIZE,
            send_buffer_size: 4 * 1024 * 1024, // 4 MB - larger to handle bursts
            recv_buffer_size: 4 * 1024 * 1024, // 4 MB - larger to prevent drops
            reuse_addr: true,
        }
    }
}

impl StreamConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.max(1))
    }
}

/// V4L2 capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// yuyv422, mjpeg, h264, ...
    pub pixel_format: String,
    /// Human-readable stream name, also used as the discovery instance name
    pub stream_name: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            pixel_format: "yuyv422".to_string(),
            stream_name: DEFAULT_INSTANCE_NAME.to_string(),
        }
    }
}

/// How the data channel is fed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// [`crate::protocol::Packet`] datagrams from the built-in sender
    #[default]
    Framed,
    /// MPEG-TS written by the media bridge
    MpegTs,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "framed" => Ok(Self::Framed),
            "mpegts" | "mpeg-ts" => Ok(Self::MpegTs),
            other => Err(format!("unknown transport `{other}` (expected framed|mpegts)")),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Framed => f.write_str("framed"),
            Self::MpegTs => f.write_str("mpegts"),
        }
    }
}

/// Media bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Encoder program
    pub ffmpeg_path: String,

    /// Preview/decoder program
    pub ffplay_path: String,

    /// Encoder name overriding platform detection (e.g. `libx264`)
    pub encoder: Option<String>,

    /// Time allowed between interrupt and forced kill
    pub grace_period_ms: u64,

    /// Data-channel transport offered by the sender
    pub transport: TransportMode,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffplay_path: "ffplay".to_string(),
            encoder: None,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            transport: TransportMode::Framed,
        }
    }
}

impl MediaConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "openndi", "openndi")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load `explicit` if given, else the default path when it exists, else defaults
    pub fn load_or_default(explicit: Option<&Path>) -> crate::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}
