//! Control-channel handshake that negotiates the data endpoint
//!
//! ## Protocol
//!
//! ```text
//! Receiver (requesting)                 Sender (offering)
//!   │                                      │
//!   │──── TCP connect ────────────────────>│  control port
//!   │                                      │
//!   │──── HELLO (name, proposed endpoint) ─>│
//!   │                                      │
//!   │<─── ACCEPT (session, endpoint, mode) ─│  or REJECT (reason)
//!   │                                      │
//!   │<════════ UDP datagrams ═════════════ │  to the negotiated endpoint
//! ```
//!
//! Every message is framed as
//! `[MAGIC(4)][VERSION(1)][TYPE(1)][LEN(2, BE)][JSON body(LEN)]`.
//! The exchange runs once per session; it is not repeated on datagram loss.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ControlConfig, TransportMode};
use crate::error::{Error, NetworkError, Result};

/// Magic bytes for handshake frames
const HANDSHAKE_MAGIC: &[u8; 4] = b"ONHS"; // OpenNDI HandShake

/// Protocol version
const PROTOCOL_VERSION: u8 = 1;

/// Frame header: magic, version, type, body length
const FRAME_HEADER_SIZE: usize = 8;

/// Largest accepted body
const MAX_BODY_SIZE: usize = 4096;

/// Handshake message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePacketType {
    Hello = 0x01,
    Accept = 0x02,
    Reject = 0x03,
}

impl TryFrom<u8> for HandshakePacketType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Accept),
            0x03 => Ok(Self::Reject),
            _ => Err(()),
        }
    }
}

/// Requesting side's opening message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Requester's display name
    pub name: String,
    /// Where the requester wants datagrams; an unspecified IP means "my address as you see it"
    pub proposed_endpoint: Option<SocketAddr>,
}

/// Offering side's agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub session_id: Uuid,
    pub receiver_endpoint: SocketAddr,
    pub transport: TransportMode,
    /// Offerer's display name
    pub name: String,
}

/// Offering side's refusal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub reason: String,
}

/// One control-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    Hello(Hello),
    Accept(Accept),
    Reject(Reject),
}

impl HandshakeMessage {
    pub fn packet_type(&self) -> HandshakePacketType {
        match self {
            Self::Hello(_) => HandshakePacketType::Hello,
            Self::Accept(_) => HandshakePacketType::Accept,
            Self::Reject(_) => HandshakePacketType::Reject,
        }
    }

    /// Serialize into one frame
    pub fn serialize(&self) -> Result<Bytes> {
        let body = match self {
            Self::Hello(m) => serde_json::to_vec(m),
            Self::Accept(m) => serde_json::to_vec(m),
            Self::Reject(m) => serde_json::to_vec(m),
        }
        .map_err(|e| Error::Handshake(format!("cannot encode message: {}", e)))?;

        if body.len() > MAX_BODY_SIZE {
            return Err(Error::Handshake(format!(
                "message body of {} bytes exceeds {}",
                body.len(),
                MAX_BODY_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.put_slice(HANDSHAKE_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet_type() as u8);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Deserialize one complete frame
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::Handshake(format!("frame of {} bytes is too short", data.len())));
        }

        let (packet_type, body_len) = parse_header(&data[..FRAME_HEADER_SIZE])?;
        let body = &data[FRAME_HEADER_SIZE..];
        if body.len() != body_len {
            return Err(Error::Handshake(format!(
                "body length mismatch: header says {}, got {}",
                body_len,
                body.len()
            )));
        }

        parse_body(packet_type, body)
    }
}

fn parse_header(header: &[u8]) -> Result<(HandshakePacketType, usize)> {
    if &header[0..4] != HANDSHAKE_MAGIC {
        return Err(Error::Handshake("bad magic, peer is not an OpenNDI endpoint".to_string()));
    }

    if header[4] != PROTOCOL_VERSION {
        return Err(Error::Handshake(format!(
            "unsupported protocol version {} (expected {})",
            header[4], PROTOCOL_VERSION
        )));
    }

    let packet_type = HandshakePacketType::try_from(header[5])
        .map_err(|_| Error::Handshake(format!("unknown message type 0x{:02x}", header[5])))?;

    let body_len = u16::from_be_bytes([header[6], header[7]]) as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(Error::Handshake(format!("message body of {} bytes exceeds {}", body_len, MAX_BODY_SIZE)));
    }

    Ok((packet_type, body_len))
}

fn parse_body(packet_type: HandshakePacketType, body: &[u8]) -> Result<HandshakeMessage> {
    let invalid = |e: serde_json::Error| Error::Handshake(format!("invalid {:?} body: {}", packet_type, e));

    Ok(match packet_type {
        HandshakePacketType::Hello => HandshakeMessage::Hello(serde_json::from_slice(body).map_err(invalid)?),
        HandshakePacketType::Accept => HandshakeMessage::Accept(serde_json::from_slice(body).map_err(invalid)?),
        HandshakePacketType::Reject => HandshakeMessage::Reject(serde_json::from_slice(body).map_err(invalid)?),
    })
}

/// Read exactly one framed message
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HandshakeMessage> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await
        .map_err(|e| Error::Handshake(format!("connection closed before message header: {}", e)))?;

    let (packet_type, body_len) = parse_header(&header)?;

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await
        .map_err(|e| Error::Handshake(format!("connection closed inside message body: {}", e)))?;

    parse_body(packet_type, &body)
}

/// Write one framed message and flush
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &HandshakeMessage) -> Result<()> {
    let frame = message.serialize()?;
    writer.write_all(&frame).await
        .map_err(|e| Error::Handshake(format!("failed to send {:?}: {}", message.packet_type(), e)))?;
    writer.flush().await
        .map_err(|e| Error::Handshake(format!("failed to send {:?}: {}", message.packet_type(), e)))?;
    Ok(())
}

/// Outcome of a successful handshake, identical on both sides except `peer_name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    pub session_id: Uuid,
    /// Where the data-phase datagrams go
    pub receiver_endpoint: SocketAddr,
    pub transport: TransportMode,
    /// Name announced by the other side
    pub peer_name: String,
}

/// What the offering side puts on the table
#[derive(Debug, Clone)]
pub struct Offer {
    pub name: String,
    /// Assigned to requesters that do not propose an endpoint
    pub data_port: u16,
    pub transport: TransportMode,
}

/// Pick the receiver endpoint for a requester at `peer_ip`
fn assign_endpoint(
    proposed: Option<SocketAddr>,
    peer_ip: IpAddr,
    default_port: u16,
) -> std::result::Result<SocketAddr, String> {
    match proposed {
        Some(endpoint) if endpoint.port() == 0 => {
            Err(format!("proposed endpoint {} has no port", endpoint))
        }
        Some(endpoint) if endpoint.ip().is_unspecified() => Ok(SocketAddr::new(peer_ip, endpoint.port())),
        Some(endpoint) => Ok(endpoint),
        None if default_port == 0 => Err("no endpoint proposed and none to assign".to_string()),
        None => Ok(SocketAddr::new(peer_ip, default_port)),
    }
}

/// Offering side: a bound control listener
pub struct ControlListener {
    listener: TcpListener,
    offer: Offer,
    timeout: Duration,
}

impl ControlListener {
    pub async fn bind(address: &str, offer: Offer, timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(address).await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", address, e)))?;

        Ok(Self {
            listener,
            offer,
            timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept exactly one peer and run the handshake with it
    pub async fn serve_one(&self, cancel: &CancellationToken) -> Result<NegotiatedConfig> {
        tracing::info!(address = %self.local_addr()?, "Waiting for a receiver on the control channel");

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            accepted = self.listener.accept() => accepted
                .map_err(|e| Error::Handshake(format!("accept failed: {}", e)))?,
        };

        tracing::debug!(%peer, "Control connection accepted");

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.timeout, offer_handshake(stream, peer, &self.offer)) => {
                result.map_err(|_| Error::Handshake(format!("{} did not complete the handshake in {:?}", peer, self.timeout)))?
            }
        }
    }
}

async fn offer_handshake(mut stream: TcpStream, peer: SocketAddr, offer: &Offer) -> Result<NegotiatedConfig> {
    let _ = stream.set_nodelay(true);

    let hello = match read_message(&mut stream).await {
        Ok(HandshakeMessage::Hello(hello)) => hello,
        Ok(other) => {
            let reason = format!("expected Hello, got {:?}", other.packet_type());
            return Err(reject(&mut stream, peer, reason).await);
        }
        Err(e) => return Err(reject(&mut stream, peer, e.to_string()).await),
    };

    let receiver_endpoint = match assign_endpoint(hello.proposed_endpoint, peer.ip(), offer.data_port) {
        Ok(endpoint) => endpoint,
        Err(reason) => return Err(reject(&mut stream, peer, reason).await),
    };

    let accept = Accept {
        session_id: Uuid::new_v4(),
        receiver_endpoint,
        transport: offer.transport,
        name: offer.name.clone(),
    };
    write_message(&mut stream, &HandshakeMessage::Accept(accept.clone())).await?;

    tracing::info!(
        %peer,
        peer_name = %hello.name,
        endpoint = %receiver_endpoint,
        session = %accept.session_id,
        "Handshake complete"
    );

    Ok(NegotiatedConfig {
        session_id: accept.session_id,
        receiver_endpoint,
        transport: accept.transport,
        peer_name: hello.name,
    })
}

/// Tell the peer why, best effort, and build the local error
async fn reject(stream: &mut TcpStream, peer: SocketAddr, reason: String) -> Error {
    tracing::warn!(%peer, "Rejecting handshake: {}", reason);
    let message = HandshakeMessage::Reject(Reject { reason: reason.clone() });
    let _ = write_message(stream, &message).await;
    Error::Handshake(format!("{}: {}", peer, reason))
}

/// Offering side: bind the control port, serve one handshake, return its result
pub async fn listen_and_serve(
    config: &ControlConfig,
    offer: Offer,
    cancel: &CancellationToken,
) -> Result<NegotiatedConfig> {
    let listener = ControlListener::bind(&config.listen_address(), offer, config.handshake_timeout()).await?;
    listener.serve_one(cancel).await
}

/// Requesting side: dial `peer`, send `hello`, return the accepted config
pub async fn connect(
    peer: SocketAddr,
    hello: Hello,
    config: &ControlConfig,
    cancel: &CancellationToken,
) -> Result<NegotiatedConfig> {
    let timeout = config.handshake_timeout();

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, request_handshake(peer, hello)) => {
            result.map_err(|_| Error::Handshake(format!("no answer from {} within {:?}", peer, timeout)))?
        }
    }
}

async fn request_handshake(peer: SocketAddr, hello: Hello) -> Result<NegotiatedConfig> {
    let mut stream = TcpStream::connect(peer).await
        .map_err(|e| Error::Handshake(format!("cannot reach {}: {}", peer, e)))?;
    let _ = stream.set_nodelay(true);

    let proposed = hello.proposed_endpoint;
    write_message(&mut stream, &HandshakeMessage::Hello(hello)).await?;

    match read_message(&mut stream).await? {
        HandshakeMessage::Accept(accept) => {
            if let Some(proposed) = proposed {
                let ip_matches = proposed.ip().is_unspecified() || proposed.ip() == accept.receiver_endpoint.ip();
                if proposed.port() != accept.receiver_endpoint.port() || !ip_matches {
                    return Err(Error::Handshake(format!(
                        "{} accepted {} instead of proposed {}",
                        peer, accept.receiver_endpoint, proposed
                    )));
                }
            }

            tracing::info!(
                %peer,
                peer_name = %accept.name,
                endpoint = %accept.receiver_endpoint,
                transport = %accept.transport,
                session = %accept.session_id,
                "Handshake complete"
            );

            Ok(NegotiatedConfig {
                session_id: accept.session_id,
                receiver_endpoint: accept.receiver_endpoint,
                transport: accept.transport,
                peer_name: accept.name,
            })
        }
        HandshakeMessage::Reject(reject) => {
            Err(Error::Handshake(format!("rejected by {}: {}", peer, reject.reason)))
        }
        HandshakeMessage::Hello(_) => Err(Error::Handshake(format!("{} answered with Hello", peer))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(data_port: u16) -> Offer {
        Offer {
            name: "cam-1".to_string(),
            data_port,
            transport: TransportMode::Framed,
        }
    }

    fn hello(proposed: Option<&str>) -> Hello {
        Hello {
            name: "monitor".to_string(),
            proposed_endpoint: proposed.map(|p| p.parse().unwrap()),
        }
    }

    fn control_config(timeout_ms: u64) -> ControlConfig {
        ControlConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            handshake_timeout_ms: timeout_ms,
        }
    }

    /// Run one handshake over loopback and return both sides' results
    async fn negotiate(
        offer: Offer,
        hello: Hello,
    ) -> (Result<NegotiatedConfig>, Result<NegotiatedConfig>) {
        let cancel = CancellationToken::new();
        let listener = ControlListener::bind("127.0.0.1:0", offer, Duration::from_secs(2)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move { listener.serve_one(&server_cancel).await });
        let client = connect(addr, hello, &control_config(2000), &cancel).await;

        (server.await.unwrap(), client)
    }

    #[test]
    fn test_message_framing() {
        let message = HandshakeMessage::Accept(Accept {
            session_id: Uuid::nil(),
            receiver_endpoint: "192.168.1.20:5000".parse().unwrap(),
            transport: TransportMode::MpegTs,
            name: "cam-1".to_string(),
        });

        let frame = message.serialize().unwrap();
        assert_eq!(&frame[0..4], HANDSHAKE_MAGIC);
        assert_eq!(frame[5], HandshakePacketType::Accept as u8);
        assert_eq!(u16::from_be_bytes([frame[6], frame[7]]) as usize, frame.len() - FRAME_HEADER_SIZE);

        assert_eq!(HandshakeMessage::deserialize(&frame).unwrap(), message);
        // Same input, same bytes
        assert_eq!(message.serialize().unwrap(), frame);
    }

    #[test]
    fn test_malformed_frames() {
        let frame = HandshakeMessage::Hello(hello(None)).serialize().unwrap();

        assert!(HandshakeMessage::deserialize(&frame[..5]).is_err());
        assert!(HandshakeMessage::deserialize(&frame[..frame.len() - 1]).is_err());

        let mut bad_magic = frame.to_vec();
        bad_magic[0] = b'X';
        assert!(HandshakeMessage::deserialize(&bad_magic).is_err());

        let mut bad_version = frame.to_vec();
        bad_version[4] = 2;
        assert!(HandshakeMessage::deserialize(&bad_version).is_err());

        let mut bad_type = frame.to_vec();
        bad_type[5] = 0x7F;
        assert!(HandshakeMessage::deserialize(&bad_type).is_err());

        let mut bad_body = frame[..FRAME_HEADER_SIZE].to_vec();
        bad_body[6..8].copy_from_slice(&2u16.to_be_bytes());
        bad_body.extend_from_slice(b"{}");
        assert!(matches!(HandshakeMessage::deserialize(&bad_body), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_assign_endpoint() {
        let peer: IpAddr = "10.0.0.7".parse().unwrap();

        assert_eq!(
            assign_endpoint(Some("10.0.0.8:6000".parse().unwrap()), peer, 5000).unwrap(),
            "10.0.0.8:6000".parse().unwrap()
        );
        assert_eq!(
            assign_endpoint(Some("0.0.0.0:6000".parse().unwrap()), peer, 5000).unwrap(),
            "10.0.0.7:6000".parse().unwrap()
        );
        assert_eq!(assign_endpoint(None, peer, 5000).unwrap(), "10.0.0.7:5000".parse().unwrap());
        assert!(assign_endpoint(Some("10.0.0.8:0".parse().unwrap()), peer, 5000).is_err());
        assert!(assign_endpoint(None, peer, 0).is_err());
    }

    #[tokio::test]
    async fn test_both_sides_agree() {
        let (offered, requested) = negotiate(offer(5000), hello(Some("127.0.0.1:6000"))).await;
        let offered = offered.unwrap();
        let requested = requested.unwrap();

        assert_eq!(offered.receiver_endpoint, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(offered.receiver_endpoint, requested.receiver_endpoint);
        assert_eq!(offered.session_id, requested.session_id);
        assert_eq!(offered.transport, requested.transport);
        assert_eq!(offered.peer_name, "monitor");
        assert_eq!(requested.peer_name, "cam-1");
    }

    #[tokio::test]
    async fn test_unspecified_proposal_uses_requester_address() {
        let (offered, requested) = negotiate(offer(5000), hello(Some("0.0.0.0:6001"))).await;
        assert_eq!(offered.unwrap().receiver_endpoint, "127.0.0.1:6001".parse().unwrap());
        assert_eq!(requested.unwrap().receiver_endpoint, "127.0.0.1:6001".parse().unwrap());
    }

    #[tokio::test]
    async fn test_endpoint_assigned_without_proposal() {
        let (offered, requested) = negotiate(offer(5002), hello(None)).await;
        assert_eq!(offered.unwrap().receiver_endpoint, "127.0.0.1:5002".parse().unwrap());
        assert_eq!(requested.unwrap().receiver_endpoint, "127.0.0.1:5002".parse().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_proposal_is_rejected() {
        let (offered, requested) = negotiate(offer(5000), hello(Some("127.0.0.1:0"))).await;
        assert!(matches!(offered, Err(Error::Handshake(_))));
        match requested {
            Err(Error::Handshake(reason)) => assert!(reason.contains("rejected"), "{}", reason),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_peer_fails_offering_side() {
        let cancel = CancellationToken::new();
        let listener = ControlListener::bind("127.0.0.1:0", offer(5000), Duration::from_secs(2)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move { listener.serve_one(&cancel).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Exactly one header's worth, so the offerer leaves nothing unread
        stream.write_all(b"GET / HT").await.unwrap();

        let reply = read_message(&mut stream).await.unwrap();
        assert!(matches!(reply, HandshakeMessage::Reject(_)));
        assert!(matches!(server.await.unwrap(), Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let cancel = CancellationToken::new();
        let listener = ControlListener::bind("127.0.0.1:0", offer(5000), Duration::from_millis(100)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move { listener.serve_one(&cancel).await });
        let _stream = TcpStream::connect(addr).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let cancel = CancellationToken::new();
        let result = connect(addr, hello(None), &control_config(1000), &cancel).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_serve_one_is_cancellable() {
        let cancel = CancellationToken::new();
        let listener = ControlListener::bind("127.0.0.1:0", offer(5000), Duration::from_secs(2)).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), listener.serve_one(&cancel))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_listen_and_serve_binds_configured_address() {
        let cancel = CancellationToken::new();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ControlConfig {
            port,
            ..control_config(2000)
        };

        let server_config = config.clone();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            listen_and_serve(&server_config, offer(5000), &server_cancel).await
        });

        // The listener may not be up yet
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let mut requested = None;
        for _ in 0..50 {
            match connect(addr, hello(Some("127.0.0.1:6100")), &config, &cancel).await {
                Ok(negotiated) => {
                    requested = Some(negotiated);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }

        let requested = requested.expect("handshake never succeeded");
        let offered = server.await.unwrap().unwrap();
        assert_eq!(offered.receiver_endpoint, requested.receiver_endpoint);
    }
}
