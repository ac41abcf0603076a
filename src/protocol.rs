//! Protocol definitions for data-channel datagrams
//!
//! ## Packet Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Packet Header (9 bytes)                  │
//! ├──────────────────┬──────────────────┬────────────────────┤
//! │   Sequence(4)    │ Acknowledgement(4)│     Flags(1)      │
//! │    u32 BE        │     u32 BE        │    see below      │
//! ├──────────────────┴──────────────────┴────────────────────┤
//! │                  Payload (variable, may be empty)        │
//! └──────────────────────────────────────────────────────────┘
//!
//! Flags byte:
//! ┌─────┬─────┬─────┬─────┬─────┬─────┬─────┬─────┐
//! │  7  │  6  │  5  │  4  │  3  │  2  │  1  │  0  │
//! │ RSV │ RSV │ RSV │ RSV │ RSV │ RSV │ ACK │DATA │
//! └─────┴─────┴─────┴─────┴─────┴─────┴─────┴─────┘
//! ```
//!
//! The acknowledgement field and the ACK bit are reserved: nothing in the
//! crate generates acknowledgements or retransmits.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 9;

/// Receive buffer size for one datagram (64 KiB)
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const DATA: u8 = 0x01;
    pub const ACK: u8 = 0x02;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn data() -> Self {
        Self(Self::DATA)
    }

    pub fn set_data(mut self, value: bool) -> Self {
        if value {
            self.0 |= Self::DATA;
        } else {
            self.0 &= !Self::DATA;
        }
        self
    }

    pub fn set_ack(mut self, value: bool) -> Self {
        if value {
            self.0 |= Self::ACK;
        } else {
            self.0 &= !Self::ACK;
        }
        self
    }

    pub fn is_data(&self) -> bool {
        self.0 & Self::DATA != 0
    }

    pub fn is_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn as_byte(&self) -> u8 {
        self.0
    }

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }
}

/// One data-channel datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sender-side sequence number, strictly increasing per sender
    pub sequence: u32,

    /// Reserved, 0 in unidirectional streams
    pub acknowledgement: u32,

    pub flags: PacketFlags,

    pub payload: Bytes,
}

impl Packet {
    /// Payload-bearing packet with no acknowledgement
    pub fn data(sequence: u32, payload: Bytes) -> Self {
        Self {
            sequence,
            acknowledgement: 0,
            flags: PacketFlags::data(),
            payload,
        }
    }

    /// Serialize packet to bytes for network transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());

        buf.put_u32(self.sequence);
        buf.put_u32(self.acknowledgement);
        buf.put_u8(self.flags.as_byte());
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Deserialize a packet; the payload shares `data`'s allocation
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket {
                len: data.len(),
                min: HEADER_SIZE,
            });
        }

        let sequence = data.get_u32();
        let acknowledgement = data.get_u32();
        let flags = PacketFlags::from_byte(data.get_u8());

        Ok(Self {
            sequence,
            acknowledgement,
            flags,
            payload: data,
        })
    }

    /// Packet size including header
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode `packet` for the wire
pub fn encode(packet: &Packet) -> Bytes {
    packet.encode()
}

/// Decode a received datagram
pub fn decode(data: &[u8]) -> Result<Packet> {
    Packet::decode(Bytes::copy_from_slice(data))
}
