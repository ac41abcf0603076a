//! Error types

use std::time::Duration;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error taxonomy
#[derive(Debug, Error)]
pub enum Error {
    /// Nobody answered a discovery query in time
    #[error("no `{service_type}` service answered within {timeout:?}")]
    DiscoveryTimeout {
        service_type: String,
        timeout: Duration,
    },

    /// Transport-level discovery failure (no usable interface, socket error)
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Refused, timed out or malformed control handshake
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Datagram too short or otherwise not a packet
    #[error("malformed packet: {len} bytes, need at least {min}")]
    MalformedPacket { len: usize, min: usize },

    /// Required external tool is not installed
    #[error("required tool `{tool}` not found in PATH")]
    DependencyMissing { tool: String },

    /// Media bridge process ended unsuccessfully
    #[error("media bridge `{program}` ended with {state}")]
    Bridge { program: String, state: String },

    /// Socket-level failure while streaming
    #[error("transport error: {0}")]
    Transport(String),

    /// Socket setup failure
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation observed its cancellation token
    #[error("operation cancelled")]
    Cancelled,
}

/// Socket construction errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind socket: {0}")]
    BindFailed(String),
}
