//! Envelope types for the rendezvous protocol
//!
//! Every exchange on either channel is one [`Envelope`]: a message type, an
//! optional human-readable text, a map over a fixed key vocabulary and, for
//! the two reply types that carry data, a typed payload.
//!
//! # Message Flow
//!
//! 1. Client opens the control channel and sends `Connect`
//! 2. Server answers `Ok` or `Error`
//! 3. Client sends `RequestList` / `RequestIp` on the signaling channel,
//!    server answers `ClientList` / `ClientIp` (or `Error`)
//! 4. Client sends `Disconnect` on the signaling channel when leaving
//!
//! # Shape Rules
//!
//! | type | required info | payload |
//! |---|---|---|
//! | `Connect` | `Login`, `Password` | none |
//! | `Ok` | none | none |
//! | `Error` | `ErrorType` | none |
//! | `RequestList` | `Login`, `Port` | none |
//! | `ClientList` | `Port` | `ClientList` |
//! | `RequestIp` | `Login` (target), `Port` | none |
//! | `ClientIp` | `Login`, `RequestIpTargetPort`, `Port` | `ClientAddress` |
//! | `Disconnect` | `Login` | none |
//!
//! `Requester` is optional on `RequestIp`.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Authentication request (control channel)
    Connect = 0x01,
    /// Authentication accepted
    Ok = 0x02,
    /// Error response (either channel)
    Error = 0x03,
    /// Directory listing request
    RequestList = 0x04,
    /// Directory listing response
    ClientList = 0x05,
    /// Peer address lookup
    RequestIp = 0x06,
    /// Peer address response
    ClientIp = 0x07,
    /// Leave the directory
    Disconnect = 0x08,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Ok),
            0x03 => Some(Self::Error),
            0x04 => Some(Self::RequestList),
            0x05 => Some(Self::ClientList),
            0x06 => Some(Self::RequestIp),
            0x07 => Some(Self::ClientIp),
            0x08 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::RequestList => "REQUEST_LIST",
            Self::ClientList => "CLIENT_LIST",
            Self::RequestIp => "REQUEST_IP",
            Self::ClientIp => "CLIENT_IP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys allowed in the info map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InfoKey {
    /// Client login (the target login on `RequestIp` / `ClientIp`)
    Login,
    /// Password presented on `Connect`
    Password,
    /// Error classification on `Error`
    ErrorType,
    /// UDP port the sender listens on for replies
    Port,
    /// Signaling port of the resolved peer on `ClientIp`
    RequestIpTargetPort,
    /// Login of the client issuing a `RequestIp`
    Requester,
}

impl InfoKey {
    /// Wire name of the key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Password => "PASSWORD",
            Self::ErrorType => "ERROR_TYPE",
            Self::Port => "PORT",
            Self::RequestIpTargetPort => "REQUEST_IP_TARGET_PORT",
            Self::Requester => "REQUESTER",
        }
    }
}

impl fmt::Display for InfoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification carried in `ErrorType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The login already holds a session
    AlreadyConnected,
    /// The login named in the request is not registered
    ClientUnknown,
    /// Authentication failure or any other rejection
    Generic,
}

impl ErrorKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyConnected => "ALREADY_CONNECTED",
            Self::ClientUnknown => "CLIENT_UNKNOWN",
            Self::Generic => "GENERIC",
        }
    }

    /// Parse a wire name
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "ALREADY_CONNECTED" => Some(Self::AlreadyConnected),
            "CLIENT_UNKNOWN" => Some(Self::ClientUnknown),
            "GENERIC" => Some(Self::Generic),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport an envelope arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Connection-oriented channel used for `Connect`
    Control,
    /// Connectionless channel used for directory queries and liveness
    Signaling,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => f.write_str("control"),
            Channel::Signaling => f.write_str("signaling"),
        }
    }
}

/// Typed data attached to a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Logins currently in the directory
    ClientList(Vec<String>),
    /// Address of a resolved peer
    ClientAddress(IpAddr),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::ClientList(_) => "client list",
            Payload::ClientAddress(_) => "client address",
        }
    }
}

/// The unit of exchange on both channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type
    pub message_type: MessageType,
    /// Optional human-readable description
    pub text: Option<String>,
    /// Info values keyed by the fixed vocabulary
    pub info: BTreeMap<InfoKey, String>,
    /// Typed payload (`ClientList` and `ClientIp` only)
    pub payload: Option<Payload>,
}

impl Envelope {
    /// Create an empty envelope of the given type
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            text: None,
            info: BTreeMap::new(),
            payload: None,
        }
    }

    /// Attach a description
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set an info value
    pub fn with_info(mut self, key: InfoKey, value: impl Into<String>) -> Self {
        self.info.insert(key, value.into());
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// `Connect` with credentials
    pub fn connect(login: &str, password: &str) -> Self {
        Self::new(MessageType::Connect)
            .with_info(InfoKey::Login, login)
            .with_info(InfoKey::Password, password)
    }

    /// `Ok` with a description
    pub fn ok(text: impl Into<String>) -> Self {
        Self::new(MessageType::Ok).with_text(text)
    }

    /// `Error` of the given kind
    pub fn error(kind: ErrorKind, text: impl Into<String>) -> Self {
        Self::new(MessageType::Error)
            .with_text(text)
            .with_info(InfoKey::ErrorType, kind.as_str())
    }

    /// `RequestList` from `login`, replies expected on `port`
    pub fn request_list(login: &str, port: u16) -> Self {
        Self::new(MessageType::RequestList)
            .with_info(InfoKey::Login, login)
            .with_info(InfoKey::Port, port.to_string())
    }

    /// `ClientList` answering on `port`
    pub fn client_list(logins: Vec<String>, port: u16) -> Self {
        Self::new(MessageType::ClientList)
            .with_info(InfoKey::Port, port.to_string())
            .with_payload(Payload::ClientList(logins))
    }

    /// `RequestIp` for `target`, replies expected on `port`
    pub fn request_ip(requester: Option<&str>, target: &str, port: u16) -> Self {
        let envelope = Self::new(MessageType::RequestIp)
            .with_info(InfoKey::Login, target)
            .with_info(InfoKey::Port, port.to_string());
        match requester {
            Some(requester) => envelope.with_info(InfoKey::Requester, requester),
            None => envelope,
        }
    }

    /// `ClientIp` resolving `target` to `address:target_port`
    pub fn client_ip(target: &str, address: IpAddr, target_port: u16, port: u16) -> Self {
        Self::new(MessageType::ClientIp)
            .with_info(InfoKey::Login, target)
            .with_info(InfoKey::RequestIpTargetPort, target_port.to_string())
            .with_info(InfoKey::Port, port.to_string())
            .with_payload(Payload::ClientAddress(address))
    }

    /// `Disconnect` for `login`
    pub fn disconnect(login: &str) -> Self {
        Self::new(MessageType::Disconnect).with_info(InfoKey::Login, login)
    }

    /// Raw info value
    pub fn info(&self, key: InfoKey) -> Option<&str> {
        self.info.get(&key).map(String::as_str)
    }

    /// Info value that must be present
    pub fn require(&self, key: InfoKey) -> Result<&str, ProtocolViolation> {
        self.info(key).ok_or(ProtocolViolation::MissingField {
            message_type: self.message_type,
            key,
        })
    }

    /// Info value parsed as a port number
    pub fn require_port(&self, key: InfoKey) -> Result<u16, ProtocolViolation> {
        let raw = self.require(key)?;
        raw.trim()
            .parse::<u16>()
            .map_err(|_| ProtocolViolation::InvalidField {
                message_type: self.message_type,
                key,
                value: raw.to_string(),
            })
    }

    /// `Login` value that must be present and non-empty
    pub fn require_login(&self) -> Result<&str, ProtocolViolation> {
        let login = self.require(InfoKey::Login)?;
        if login.is_empty() {
            return Err(ProtocolViolation::InvalidField {
                message_type: self.message_type,
                key: InfoKey::Login,
                value: String::new(),
            });
        }
        Ok(login)
    }

    /// Error classification of an `Error` envelope
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.info(InfoKey::ErrorType).and_then(ErrorKind::from_wire)
    }

    /// Login list of a `ClientList` envelope
    pub fn client_logins(&self) -> Option<&[String]> {
        match &self.payload {
            Some(Payload::ClientList(logins)) => Some(logins),
            _ => None,
        }
    }

    /// Resolved address of a `ClientIp` envelope
    pub fn client_address(&self) -> Option<IpAddr> {
        match &self.payload {
            Some(Payload::ClientAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Check the envelope against the shape rules of its type
    pub fn validate(&self) -> Result<(), ProtocolViolation> {
        match self.message_type {
            MessageType::Connect => {
                self.require_login()?;
                self.require(InfoKey::Password)?;
                self.expect_no_payload()
            }
            MessageType::Ok => self.expect_no_payload(),
            MessageType::Error => {
                let raw = self.require(InfoKey::ErrorType)?;
                if ErrorKind::from_wire(raw).is_none() {
                    return Err(ProtocolViolation::InvalidField {
                        message_type: self.message_type,
                        key: InfoKey::ErrorType,
                        value: raw.to_string(),
                    });
                }
                self.expect_no_payload()
            }
            MessageType::RequestList | MessageType::RequestIp => {
                self.require_login()?;
                self.require_port(InfoKey::Port)?;
                self.expect_no_payload()
            }
            MessageType::ClientList => {
                self.require_port(InfoKey::Port)?;
                self.expect_payload("client list", |p| matches!(p, Payload::ClientList(_)))
            }
            MessageType::ClientIp => {
                self.require_login()?;
                self.require_port(InfoKey::RequestIpTargetPort)?;
                self.require_port(InfoKey::Port)?;
                self.expect_payload("client address", |p| {
                    matches!(p, Payload::ClientAddress(_))
                })
            }
            MessageType::Disconnect => {
                self.require_login()?;
                self.expect_no_payload()
            }
        }
    }

    fn expect_no_payload(&self) -> Result<(), ProtocolViolation> {
        match &self.payload {
            None => Ok(()),
            Some(_) => Err(ProtocolViolation::UnexpectedPayload {
                message_type: self.message_type,
            }),
        }
    }

    fn expect_payload(
        &self,
        expected: &'static str,
        matches: impl Fn(&Payload) -> bool,
    ) -> Result<(), ProtocolViolation> {
        match &self.payload {
            Some(payload) if matches(payload) => Ok(()),
            Some(_) => Err(ProtocolViolation::UnexpectedPayload {
                message_type: self.message_type,
            }),
            None => Err(ProtocolViolation::MissingPayload {
                message_type: self.message_type,
                expected,
            }),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type)?;
        for (key, value) in &self.info {
            if *key == InfoKey::Password {
                write!(f, " {}=***", key)?;
            } else {
                write!(f, " {}={}", key, value)?;
            }
        }
        if let Some(payload) = &self.payload {
            write!(f, " [{}]", payload.kind())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_message_type_byte_mapping() {
        for msg_type in [
            MessageType::Connect,
            MessageType::Ok,
            MessageType::Error,
            MessageType::RequestList,
            MessageType::ClientList,
            MessageType::RequestIp,
            MessageType::ClientIp,
            MessageType::Disconnect,
        ] {
            assert_eq!(MessageType::from_u8(msg_type.as_u8()), Some(msg_type));
        }
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0xFF), None);
    }

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(
            ErrorKind::from_wire("ALREADY_CONNECTED"),
            Some(ErrorKind::AlreadyConnected)
        );
        assert_eq!(ErrorKind::from_wire("CLIENT_UNKNOWN"), Some(ErrorKind::ClientUnknown));
        assert_eq!(ErrorKind::from_wire("nope"), None);
    }

    #[test]
    fn test_constructors_pass_validation() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        for envelope in [
            Envelope::connect("alice", "p1"),
            Envelope::ok("welcome"),
            Envelope::error(ErrorKind::ClientUnknown, "unknown"),
            Envelope::request_list("alice", 4000),
            Envelope::client_list(vec!["alice".into()], 4000),
            Envelope::request_ip(Some("alice"), "bob", 4000),
            Envelope::request_ip(None, "bob", 4000),
            Envelope::client_ip("bob", addr, 5000, 4000),
            Envelope::disconnect("alice"),
        ] {
            assert_eq!(envelope.validate(), Ok(()), "{}", envelope);
        }
    }

    #[test]
    fn test_missing_login_is_rejected() {
        let envelope = Envelope::new(MessageType::RequestList).with_info(InfoKey::Port, "4000");
        assert_eq!(
            envelope.validate(),
            Err(ProtocolViolation::MissingField {
                message_type: MessageType::RequestList,
                key: InfoKey::Login,
            })
        );
    }

    #[test]
    fn test_empty_login_is_rejected() {
        let envelope = Envelope::connect("", "secret");
        assert!(matches!(
            envelope.validate(),
            Err(ProtocolViolation::InvalidField {
                key: InfoKey::Login,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let envelope = Envelope::new(MessageType::RequestIp)
            .with_info(InfoKey::Login, "bob")
            .with_info(InfoKey::Port, "70000");
        assert_eq!(
            envelope.validate(),
            Err(ProtocolViolation::InvalidField {
                message_type: MessageType::RequestIp,
                key: InfoKey::Port,
                value: "70000".to_string(),
            })
        );
    }

    #[test]
    fn test_payload_shape_is_enforced() {
        let wrong = Envelope::new(MessageType::ClientList)
            .with_info(InfoKey::Port, "4000")
            .with_payload(Payload::ClientAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(
            wrong.validate(),
            Err(ProtocolViolation::UnexpectedPayload {
                message_type: MessageType::ClientList
            })
        );

        let missing = Envelope::new(MessageType::ClientList).with_info(InfoKey::Port, "4000");
        assert!(matches!(
            missing.validate(),
            Err(ProtocolViolation::MissingPayload { .. })
        ));

        let stray = Envelope::disconnect("alice").with_payload(Payload::ClientList(vec![]));
        assert!(matches!(
            stray.validate(),
            Err(ProtocolViolation::UnexpectedPayload { .. })
        ));
    }

    #[test]
    fn test_display_masks_password() {
        let rendered = Envelope::connect("alice", "hunter2").to_string();
        assert!(rendered.contains("LOGIN=alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
