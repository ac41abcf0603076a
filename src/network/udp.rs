//! Low-level UDP socket handling
//!
//! Datagram sockets for the data channel, tuned with larger kernel
//! buffers so bursts of video datagrams are not dropped.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket as TokioUdpSocket;

use crate::config::StreamConfig;
use crate::error::NetworkError;

/// Re-export for convenience
pub type UdpSocket = TokioUdpSocket;

/// Create a configured, non-blocking UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr, config: &StreamConfig) -> Result<StdUdpSocket, NetworkError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    socket.bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let std_socket: StdUdpSocket = socket.into();
    std_socket.set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(std_socket)
}

/// Create async UDP socket for tokio
pub fn create_async_socket(addr: SocketAddr, config: &StreamConfig) -> Result<TokioUdpSocket, NetworkError> {
    let std_socket = create_socket(addr, config)?;
    TokioUdpSocket::from_std(std_socket)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))
}

/// Unspecified address of the same family as `target`, for an ephemeral sending socket
pub fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

fn configure_socket(socket: &Socket, config: &StreamConfig) -> Result<(), NetworkError> {
    if config.reuse_addr {
        socket.set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    // The kernel may clamp these; a smaller buffer is not an error
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
        tracing::debug!("Failed to set send buffer: {}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        tracing::debug!("Failed to set recv buffer: {}", e);
    }

    Ok(())
}
