//! rdv-protocol: Envelope schema and wire codec for the rendezvous server
//!
//! Both the control channel (TCP) and the signaling channel (UDP) exchange
//! the same [`Envelope`] unit. This crate defines its schema, the per-type
//! shape rules, and the framing used on the wire.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;

pub use codec::{decode_datagram, encode_datagram, encoded_len, fits_datagram, EnvelopeCodec};
pub use envelope::{Channel, Envelope, ErrorKind, InfoKey, MessageType, Payload};
pub use error::{ProtocolError, ProtocolViolation};
pub use frame::{
    FrameHeader, HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
