//! Framed datagram sender
//!
//! Emits one [`Packet`] per tick to the negotiated endpoint. Sequence
//! numbers start at 0 and increase by one per emitted packet; the
//! acknowledgement field stays 0. Sends are best effort: a failed send is
//! counted and logged, never retried.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::error::Result;
use crate::network::udp::{create_async_socket, unspecified_for, UdpSocket};
use crate::protocol::Packet;

/// Produces the payload of each outgoing packet
pub trait PayloadSource: Send {
    fn next_payload(&mut self, sequence: u32) -> Bytes;
}

impl<F> PayloadSource for F
where
    F: FnMut(u32) -> Bytes + Send,
{
    fn next_payload(&mut self, sequence: u32) -> Bytes {
        self(sequence)
    }
}

/// Fixed-size zeroed payload, a stand-in frame
#[derive(Debug, Clone)]
pub struct ZeroPayload {
    payload: Bytes,
}

impl ZeroPayload {
    pub fn new(size: usize) -> Self {
        Self {
            payload: Bytes::from(vec![0u8; size]),
        }
    }
}

impl PayloadSource for ZeroPayload {
    fn next_payload(&mut self, _sequence: u32) -> Bytes {
        self.payload.clone()
    }
}

/// Sender statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    /// Sequence number the next packet will carry
    pub next_sequence: u32,
}

/// Periodic datagram sender owning its socket
pub struct DatagramSender {
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    sequence: u32,
    stats: SenderStats,
}

impl DatagramSender {
    pub fn new(socket: UdpSocket, target: SocketAddr, interval: Duration) -> Self {
        Self {
            socket,
            target,
            interval,
            sequence: 0,
            stats: SenderStats::default(),
        }
    }

    /// Sender on an ephemeral local port, aimed at `target`
    pub fn bind(target: SocketAddr, config: &StreamConfig) -> Result<Self> {
        let socket = create_async_socket(unspecified_for(&target), config)?;
        Ok(Self::new(socket, target, config.send_interval()))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Frame `payload` with the next sequence number and send it once
    pub async fn send_next(&mut self, payload: Bytes) -> io::Result<usize> {
        let packet = Packet::data(self.sequence, payload);
        self.sequence = self.sequence.wrapping_add(1);
        self.stats.next_sequence = self.sequence;

        let data = packet.encode();
        let result = self.socket.send_to(&data, self.target).await;
        match &result {
            Ok(sent) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += *sent as u64;
            }
            Err(_) => self.stats.send_failures += 1,
        }
        result
    }

    /// Send on every tick until cancelled
    pub async fn run<S: PayloadSource>(mut self, source: &mut S, cancel: &CancellationToken) -> SenderStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(target = %self.target, interval = ?self.interval, "Datagram sender started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sequence = self.sequence;
            let payload = source.next_payload(sequence);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.send_next(payload) => result,
            };

            if let Err(e) = result {
                // Only log periodically to avoid log spam
                let failures = self.stats.send_failures;
                if failures == 1 || failures % 1000 == 0 {
                    tracing::warn!(sequence, failures, target = %self.target, "Failed to send packet: {}", e);
                }
            }
        }

        tracing::info!(
            packets = self.stats.packets_sent,
            bytes = self.stats.bytes_sent,
            failures = self.stats.send_failures,
            "Datagram sender stopped"
        );
        self.stats
    }
}
