//! Zero-config service discovery
//!
//! A sender advertises `(instance name, service type, control port)`; a
//! receiver resolves the service type to an address without any manual IP
//! configuration. The exchange is DNS-SD shaped but uses its own compact
//! datagrams on a dedicated multicast group:
//!
//! ```text
//! Finder                                   Advertiser
//!   │                                          │
//!   │──── QUERY(_openndi._udp) ──> group:port ─│   (re-sent every query interval)
//!   │                                          │
//!   │<─── ANSWER(name, port) ── unicast ───────│
//!   │                                          │
//! ```
//!
//! The answering host is the source address of the ANSWER datagram. The
//! first matching answer wins; further responders are not collected.

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::{Error, NetworkError, Result};

/// Magic bytes for discovery packets
const DISCOVERY_MAGIC: &[u8; 4] = b"ONDS"; // OpenNDI Discovery Service

const DISCOVERY_VERSION: u8 = 1;

/// Longest encodable service type or instance name
const MAX_FIELD_LEN: usize = 255;

/// Discovery packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPacketType {
    /// "Who offers this service type?"
    Query = 0x01,
    /// "I do, at this port"
    Answer = 0x02,
}

impl TryFrom<u8> for DiscoveryPacketType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Query),
            0x02 => Ok(Self::Answer),
            _ => Err(()),
        }
    }
}

/// Discovery packet structure
/// Format: [MAGIC(4)][VERSION(1)][TYPE(1)][PORT(2)][TYPE_LEN(1)][TYPE][NAME_LEN(1)][NAME]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub packet_type: DiscoveryPacketType,
    pub port: u16,
    pub service_type: String,
    pub name: String,
}

impl DiscoveryPacket {
    pub fn query(service_type: &str) -> Self {
        Self {
            packet_type: DiscoveryPacketType::Query,
            port: 0,
            service_type: truncate_utf8(service_type, MAX_FIELD_LEN).to_string(),
            name: String::new(),
        }
    }

    pub fn answer(service_type: &str, name: &str, port: u16) -> Self {
        Self {
            packet_type: DiscoveryPacketType::Answer,
            port,
            service_type: truncate_utf8(service_type, MAX_FIELD_LEN).to_string(),
            name: truncate_utf8(name, MAX_FIELD_LEN).to_string(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let service_type = truncate_utf8(&self.service_type, MAX_FIELD_LEN).as_bytes();
        let name = truncate_utf8(&self.name, MAX_FIELD_LEN).as_bytes();
        let mut data = Vec::with_capacity(10 + service_type.len() + name.len());

        data.extend_from_slice(DISCOVERY_MAGIC);
        data.push(DISCOVERY_VERSION);
        data.push(self.packet_type as u8);
        data.extend_from_slice(&self.port.to_be_bytes());
        data.push(service_type.len() as u8);
        data.extend_from_slice(service_type);
        data.push(name.len() as u8);
        data.extend_from_slice(name);

        data
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < 10 {
            return None;
        }

        if &data[0..4] != DISCOVERY_MAGIC || data[4] != DISCOVERY_VERSION {
            return None;
        }

        let packet_type = DiscoveryPacketType::try_from(data[5]).ok()?;
        let port = u16::from_be_bytes([data[6], data[7]]);

        let type_len = data[8] as usize;
        let type_end = 9 + type_len;
        let service_type = std::str::from_utf8(data.get(9..type_end)?).ok()?.to_string();

        let name_len = *data.get(type_end)? as usize;
        let name_start = type_end + 1;
        let name = std::str::from_utf8(data.get(name_start..name_start + name_len)?)
            .ok()?
            .to_string();

        Some(Self {
            packet_type,
            port,
            service_type,
            name,
        })
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A resolved service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    /// Instance name, e.g. `openndi-sender`
    pub name: String,
    /// Service type, e.g. `_openndi._udp`
    pub service_type: String,
    /// Address the answer came from
    pub address: IpAddr,
    /// Advertised port
    pub port: u16,
}

impl ServiceRecord {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Create a discovery socket bound to `bind:port`, joined to the group when it is multicast
fn create_discovery_socket(
    config: &DiscoveryConfig,
    bind: Ipv4Addr,
    port: u16,
    join_group: bool,
) -> std::result::Result<StdUdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket.set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(bind, port));
    socket.bind(&bind_addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind_addr, e)))?;

    if config.group.is_multicast() {
        socket.set_multicast_ttl_v4(config.multicast_ttl)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket.set_multicast_loop_v4(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        if join_group {
            let interface = if bind.is_unspecified() { Ipv4Addr::UNSPECIFIED } else { bind };
            socket.join_multicast_v4(&config.group, &interface)
                .map_err(|e| NetworkError::BindFailed(format!("join {}: {}", config.group, e)))?;
        }
    }

    socket.set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

fn into_tokio(socket: StdUdpSocket) -> Result<UdpSocket> {
    UdpSocket::from_std(socket).map_err(|e| Error::Discovery(e.to_string()))
}

/// A running advertisement; answering stops on drop or [`Advertiser::stop`]
pub struct Advertiser {
    record: ServiceRecord,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Advertiser {
    /// Address the responder is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The record being advertised (address is the bind address)
    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Register `instance_name` under `service_type` and answer queries until cancelled
///
/// Must be called from within a tokio runtime.
pub fn advertise(
    config: &DiscoveryConfig,
    instance_name: &str,
    service_type: &str,
    port: u16,
    cancel: &CancellationToken,
) -> Result<Advertiser> {
    let socket = create_discovery_socket(config, config.bind_address, config.port, true)
        .map_err(|e| Error::Discovery(e.to_string()))?;
    let socket = into_tokio(socket)?;
    let local_addr = socket.local_addr()?;

    let answer = DiscoveryPacket::answer(service_type, instance_name, port);
    let record = ServiceRecord {
        name: answer.name.clone(),
        service_type: answer.service_type.clone(),
        address: local_addr.ip(),
        port,
    };

    let cancel = cancel.child_token();
    let handle = tokio::spawn(responder_loop(socket, answer, cancel.clone()));

    tracing::info!(
        name = %record.name,
        service = %record.service_type,
        port,
        %local_addr,
        "Service advertised"
    );

    Ok(Advertiser {
        record,
        local_addr,
        cancel,
        handle: Some(handle),
    })
}

/// Responder loop - answer matching queries
async fn responder_loop(socket: UdpSocket, answer: DiscoveryPacket, cancel: CancellationToken) {
    let data = answer.serialize();
    let mut buffer = [0u8; 512];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((size, from)) => {
                let Some(packet) = DiscoveryPacket::deserialize(&buffer[..size]) else {
                    continue;
                };
                if packet.packet_type != DiscoveryPacketType::Query
                    || packet.service_type != answer.service_type
                {
                    continue;
                }

                tracing::debug!(%from, service = %packet.service_type, "Answering discovery query");
                if let Err(e) = socket.send_to(&data, from).await {
                    tracing::warn!(%from, "Failed to answer discovery query: {}", e);
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                tracing::warn!("Discovery receive error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        }
    }

    tracing::debug!(service = %answer.service_type, "Advertisement stopped");
}

/// ICMP feedback surfaced on unconnected sockets (notably on Windows)
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

/// Resolve `service_type` to the first responder's record
pub async fn resolve(
    config: &DiscoveryConfig,
    service_type: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ServiceRecord> {
    let socket = create_discovery_socket(config, Ipv4Addr::UNSPECIFIED, 0, false)
        .map_err(|e| Error::Discovery(e.to_string()))?;
    let socket = into_tokio(socket)?;

    let query = DiscoveryPacket::query(service_type);
    let query_data = query.serialize();
    let target = config.query_target();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(config.query_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buffer = [0u8; 512];

    tracing::debug!(service = service_type, %target, ?timeout, "Resolving service");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(Error::Cancelled),

            _ = &mut deadline => {
                return Err(Error::DiscoveryTimeout {
                    service_type: service_type.to_string(),
                    timeout,
                });
            }

            _ = ticker.tick() => {
                socket.send_to(&query_data, target).await.map_err(|e| {
                    Error::Discovery(format!("cannot send query to {}: {}", target, e))
                })?;
            }

            received = socket.recv_from(&mut buffer) => {
                let (size, from) = match received {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => return Err(Error::Discovery(e.to_string())),
                };

                let Some(packet) = DiscoveryPacket::deserialize(&buffer[..size]) else {
                    continue;
                };
                if packet.packet_type != DiscoveryPacketType::Answer
                    || packet.service_type != query.service_type
                {
                    continue;
                }

                let record = ServiceRecord {
                    name: packet.name,
                    service_type: packet.service_type,
                    address: from.ip(),
                    port: packet.port,
                };
                tracing::info!(name = %record.name, address = %record.socket_addr(), "Service resolved");
                return Ok(record);
            }
        }
    }
}

/// Resolve `service_type` to the first responder's address
pub async fn find(
    config: &DiscoveryConfig,
    service_type: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<SocketAddr> {
    resolve(config, service_type, timeout, cancel)
        .await
        .map(|record| record.socket_addr())
}
