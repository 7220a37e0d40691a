//! Binary frame codec for the reader's serial protocol.
//!
//! Every packet, in both directions, has the same shape:
//!
//! ```text
//! +------+-----+---------+-----+-----------+----------+
//! | 0xA0 | LEN | ADDRESS | CMD | PAYLOAD.. | CHECKSUM |
//! +------+-----+---------+-----+-----------+----------+
//! ```
//!
//! `LEN` counts the bytes after itself (address, command, payload, checksum),
//! so it is always `payload.len() + 3`. The checksum is the two's complement of
//! the 8-bit sum of every byte before it.

use crate::types::bytes_to_hex;

/// Packet type byte that opens every frame
pub const HEADER: u8 = 0xA0;

/// Public (broadcast) reader address
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Shortest possible frame: header, length, address, command, checksum
pub const MIN_FRAME_LEN: usize = 5;

/// Offset of the first payload byte inside a raw frame
pub const PAYLOAD_OFFSET: usize = 4;

/// Largest payload that still fits the one-byte length field
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 3;

/// One complete protocol packet.
///
/// A `Frame` is immutable once built. Outgoing frames come from
/// [`Frame::new`]/[`Frame::without_payload`], incoming ones from
/// [`Frame::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data_len: u8,
    address: u8,
    command: u8,
    payload: Vec<u8>,
    checksum: u8,
    raw: Vec<u8>,
}

impl Frame {
    /// Build an outgoing frame.
    ///
    /// Payloads longer than [`MAX_PAYLOAD_LEN`] are truncated; the reader never
    /// accepts them and the length byte could not describe them.
    pub fn new(address: u8, command: u8, payload: &[u8]) -> Self {
        let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
        let data_len = (payload.len() + 3) as u8;

        let mut raw = Vec::with_capacity(payload.len() + MIN_FRAME_LEN);
        raw.extend_from_slice(&[HEADER, data_len, address, command]);
        raw.extend_from_slice(payload);
        let checksum = checksum(&raw);
        raw.push(checksum);

        Self {
            data_len,
            address,
            command,
            payload: payload.to_vec(),
            checksum,
            raw,
        }
    }

    /// Build an outgoing frame for a command that takes no parameters
    pub fn without_payload(address: u8, command: u8) -> Self {
        Self::new(address, command, &[])
    }

    /// Parse one raw frame.
    ///
    /// Returns `None` when the trailing byte is not the checksum of the rest,
    /// when the length byte disagrees with the number of bytes, or when the
    /// window is shorter than a minimal frame. Callers treat `None` as "no
    /// data"; it is never an error worth propagating.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return None;
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 1);
        if checksum(body) != trailer[0] {
            return None;
        }
        if bytes[1] as usize + 2 != bytes.len() {
            return None;
        }

        Some(Self {
            data_len: bytes[1],
            address: bytes[2],
            command: bytes[3],
            payload: body[PAYLOAD_OFFSET..].to_vec(),
            checksum: trailer[0],
            raw: bytes.to_vec(),
        })
    }

    pub fn packet_type(&self) -> u8 {
        self.raw[0]
    }

    /// Value of the length byte (payload length + 3)
    pub fn data_len(&self) -> u8 {
        self.data_len
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// The frame exactly as it travels on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// First payload byte, where single-status responses carry their code
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Uppercase hex dump of the raw frame, for logs
    pub fn to_hex(&self) -> String {
        bytes_to_hex(&self.raw)
    }
}

/// Two's-complement checksum: `(!sum(bytes) + 1) & 0xFF`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}
