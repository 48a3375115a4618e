//! Frame header encoding/decoding
//!
//! Every envelope is preceded by a 6-byte header:
//! - version: 1 byte (u8)
//! - message_type: 1 byte (u8)
//! - payload_length: 4 bytes (u32, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::envelope::MessageType;
use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 6;

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header)
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Maximum body size, so that a whole frame fits in one IPv4 UDP datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Wire format version written into every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header preceding each serialized envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Wire format version
    pub version: u8,
    /// Type of the envelope in the body
    pub message_type: MessageType,
    /// Length of the body in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a header for the current protocol version
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.version);
        dst.put_u8(self.message_type.as_u8());
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err on a foreign version or an unknown message type; in that
    /// case nothing is consumed.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let version = src[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let msg_type_byte = src[1];
        let message_type = MessageType::from_u8(msg_type_byte)
            .ok_or(ProtocolError::UnknownMessageType(msg_type_byte))?;

        src.advance(2);
        let payload_length = src.get_u32();

        Ok(Some(Self {
            version,
            message_type,
            payload_length,
        }))
    }
}
