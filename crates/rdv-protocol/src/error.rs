//! Protocol error types

use thiserror::Error;

use crate::envelope::{Channel, InfoKey, MessageType};

/// Errors that can occur while encoding or decoding envelopes
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame was produced by an incompatible protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown message type
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Incomplete frame received
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// A datagram carried bytes past the end of its frame
    #[error("Datagram has {0} trailing bytes after the frame")]
    TrailingBytes(usize),

    /// Header type byte disagrees with the decoded body
    #[error("Header announces {header} but body is {body}")]
    TypeMismatch {
        header: MessageType,
        body: MessageType,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An envelope that decoded fine but breaks the contract of its type or of
/// the channel it arrived on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The receiving channel does not handle this message type
    #[error("{message_type} is not handled on the {channel} channel")]
    UnsupportedType {
        channel: Channel,
        message_type: MessageType,
    },

    /// A required info key is absent
    #[error("{message_type} is missing required field {key}")]
    MissingField {
        message_type: MessageType,
        key: InfoKey,
    },

    /// An info value could not be interpreted
    #[error("{message_type} field {key} has invalid value {value:?}")]
    InvalidField {
        message_type: MessageType,
        key: InfoKey,
        value: String,
    },

    /// A payload was attached to a type that carries none, or the wrong kind
    #[error("{message_type} carries an unexpected payload")]
    UnexpectedPayload { message_type: MessageType },

    /// A type that requires a payload arrived without one
    #[error("{message_type} requires a {expected} payload")]
    MissingPayload {
        message_type: MessageType,
        expected: &'static str,
    },
}
