//! Network subsystem
//!
//! Contains modules for:
//! - UDP sockets for the data channel
//! - Framed datagram sending and receiving
//! - Service discovery on the LAN
//! - The control handshake that negotiates the data endpoint

pub mod udp;
pub mod sender;
pub mod receiver;
pub mod discovery;
pub mod handshake;

pub use udp::{UdpSocket, create_socket, create_async_socket};
pub use sender::{DatagramSender, PayloadSource, SenderStats, ZeroPayload};
pub use receiver::{DatagramReceiver, FrameSink, ReceivedFrame, ReceiverStats};
pub use discovery::{Advertiser, ServiceRecord, advertise, find, resolve};
pub use handshake::{ControlListener, HandshakeMessage, Hello, NegotiatedConfig, Offer, connect, listen_and_serve};
