//! Datagram receiver
//!
//! Owns the data socket for one session, decodes every datagram and hands
//! the result to a [`FrameSink`]. A datagram that fails to decode is
//! counted and logged; the loop keeps going. A socket error ends the loop
//! with [`Error::Transport`].

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{StreamConfig, TransportMode};
use crate::error::{Error, Result};
use crate::network::udp::{create_async_socket, UdpSocket};
use crate::protocol::{Packet, PacketFlags, HEADER_SIZE, MAX_DATAGRAM_SIZE};

/// Received frame ready for the consumer
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// Wire sequence, or arrival index for raw datagrams
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: PacketFlags,
    pub payload: Bytes,
    pub source: SocketAddr,
    pub received_at: Instant,
}

impl ReceivedFrame {
    fn from_packet(packet: Packet, source: SocketAddr) -> Self {
        Self {
            sequence: packet.sequence,
            acknowledgement: packet.acknowledgement,
            flags: packet.flags,
            payload: packet.payload,
            source,
            received_at: Instant::now(),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Consumer of received frames
pub trait FrameSink: Send {
    fn on_frame(&mut self, frame: ReceivedFrame);
}

impl<F> FrameSink for F
where
    F: FnMut(ReceivedFrame) + Send,
{
    fn on_frame(&mut self, frame: ReceivedFrame) {
        self(frame)
    }
}

impl FrameSink for mpsc::UnboundedSender<ReceivedFrame> {
    fn on_frame(&mut self, frame: ReceivedFrame) {
        // A consumer that went away just stops seeing frames
        let _ = self.send(frame);
    }
}

/// Loss and reordering bookkeeping from sequence gaps
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last_sequence: Option<u32>,
    packets_lost: u64,
    out_of_order: u64,
}

impl SequenceTracker {
    pub fn observe(&mut self, sequence: u32) {
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if sequence != expected {
                let gap = sequence.wrapping_sub(expected);
                if gap < u32::MAX / 2 {
                    // Packets lost
                    self.packets_lost += gap as u64;
                } else {
                    // Late arrival; do not move the high-water mark back
                    self.out_of_order += 1;
                    return;
                }
            }
        }
        self.last_sequence = Some(sequence);
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}

/// Receiver statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub packets_lost: u64,
    pub out_of_order: u64,
}

impl ReceiverStats {
    pub fn loss_rate(&self) -> f32 {
        let expected = self.packets_received + self.packets_lost;
        if expected > 0 {
            self.packets_lost as f32 / expected as f32
        } else {
            0.0
        }
    }
}

/// Receive loop owning the data socket
pub struct DatagramReceiver {
    socket: UdpSocket,
    transport: TransportMode,
    recv_buffer: Vec<u8>,
    tracker: SequenceTracker,
    stats: ReceiverStats,
    raw_index: u32,
}

impl DatagramReceiver {
    pub fn new(socket: UdpSocket, transport: TransportMode) -> Self {
        Self {
            socket,
            transport,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            tracker: SequenceTracker::default(),
            stats: ReceiverStats::default(),
            raw_index: 0,
        }
    }

    /// Bind exactly `endpoint`
    ///
    /// The data socket is never shared: SO_REUSEADDR stays off whatever
    /// `config.reuse_addr` says, so a port held by another session fails
    /// to bind instead of splitting its datagrams.
    pub fn bind(endpoint: SocketAddr, transport: TransportMode, config: &StreamConfig) -> Result<Self> {
        let exclusive = StreamConfig {
            reuse_addr: false,
            ..config.clone()
        };
        let socket = create_async_socket(endpoint, &exclusive)?;
        let mut receiver = Self::new(socket, transport);
        receiver.recv_buffer = vec![0u8; config.max_datagram_size.clamp(HEADER_SIZE, MAX_DATAGRAM_SIZE)];
        Ok(receiver)
    }

    /// Bind `ip:preferred_port`, falling back to an OS-assigned port when it is taken
    pub fn bind_available(ip: IpAddr, preferred_port: u16, config: &StreamConfig) -> Result<Self> {
        match Self::bind(SocketAddr::new(ip, preferred_port), TransportMode::Framed, config) {
            Ok(receiver) => Ok(receiver),
            Err(e) if preferred_port != 0 => {
                tracing::warn!("Port {} unavailable ({}), using an ephemeral port", preferred_port, e);
                Self::bind(SocketAddr::new(ip, 0), TransportMode::Framed, config)
            }
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_transport(&mut self, transport: TransportMode) {
        self.transport = transport;
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets_lost: self.tracker.packets_lost(),
            out_of_order: self.tracker.out_of_order(),
            ..self.stats.clone()
        }
    }

    /// Receive until cancelled or the socket fails; the socket is released on return
    pub async fn run<K: FrameSink>(mut self, sink: &mut K, cancel: &CancellationToken) -> Result<ReceiverStats> {
        tracing::info!(
            address = %self.local_addr()?,
            transport = %self.transport,
            "Datagram receiver started"
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut self.recv_buffer) => received,
            };

            match received {
                Ok((size, source)) => self.handle_datagram(size, source, sink),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    // ICMP feedback on some platforms, not a socket failure
                    tracing::debug!("Ignoring connection reset on datagram socket");
                }
                Err(e) => {
                    tracing::error!("Receive error: {}", e);
                    return Err(Error::Transport(e.to_string()));
                }
            }
        }

        let stats = self.stats();
        tracing::info!(
            packets = stats.packets_received,
            invalid = stats.invalid_packets,
            lost = stats.packets_lost,
            "Datagram receiver stopped"
        );
        Ok(stats)
    }

    fn handle_datagram<K: FrameSink>(&mut self, size: usize, source: SocketAddr, sink: &mut K) {
        self.stats.bytes_received += size as u64;
        let data = Bytes::copy_from_slice(&self.recv_buffer[..size]);

        let frame = match self.transport {
            TransportMode::Framed => match Packet::decode(data) {
                Ok(packet) => {
                    self.tracker.observe(packet.sequence);
                    ReceivedFrame::from_packet(packet, source)
                }
                Err(e) => {
                    self.stats.invalid_packets += 1;
                    tracing::warn!(%source, "Decode error: {}", e);
                    return;
                }
            },
            TransportMode::MpegTs => {
                let sequence = self.raw_index;
                self.raw_index = self.raw_index.wrapping_add(1);
                ReceivedFrame::from_packet(Packet::data(sequence, data), source)
            }
        };

        self.stats.packets_received += 1;
        tracing::trace!(
            sequence = frame.sequence,
            bytes = frame.payload_len(),
            %source,
            "Received packet"
        );
        sink.on_frame(frame);
    }
}
