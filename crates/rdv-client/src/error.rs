//! Client error types

use std::io;
use std::time::Duration;

use thiserror::Error;

use rdv_protocol::{MessageType, ProtocolError, ProtocolViolation};

/// Errors returned by [`crate::RendezvousClient`]
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("Malformed reply: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The login already holds a session on the server
    #[error("Client already connected: {0}")]
    AlreadyConnected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server does not know the login (never connected, evicted, or
    /// disconnected)
    #[error("Client unknown: {0}")]
    ClientUnknown(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Control connection closed by server")]
    ConnectionClosed,

    #[error("Expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: MessageType,
        actual: MessageType,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;
