//! Control channel (TCP)
//!
//! Clients authenticate here with `Connect`. The accept loop hands each
//! connection to its own task; the handler itself holds no state beyond
//! the shared registry.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rdv_core::Login;
use rdv_protocol::{
    Channel, Envelope, EnvelopeCodec, ErrorKind, InfoKey, MessageType, ProtocolError,
    ProtocolViolation,
};

use crate::session::Session;
use crate::state::ServerState;

/// Why a control connection ended abnormally
#[derive(Error, Debug)]
pub enum ControlError {
    /// Client sent something the control channel does not accept
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Stream could not be decoded or written
    #[error("Codec error: {0}")]
    Codec(#[from] ProtocolError),
}

/// Result of a `Connect` attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Client authenticated and registered
    Accepted(Session),
    /// Login already holds a session
    AlreadyConnected(Login),
    /// Wrong login or password
    Rejected(Login),
}

impl ConnectOutcome {
    /// Envelope sent back to the client
    pub fn reply(&self) -> Envelope {
        match self {
            ConnectOutcome::Accepted(_) => Envelope::ok("Able to authenticate client."),
            ConnectOutcome::AlreadyConnected(_) => Envelope::error(
                ErrorKind::AlreadyConnected,
                "Error: client already connected.",
            ),
            ConnectOutcome::Rejected(_) => Envelope::error(
                ErrorKind::Generic,
                "Unable to authenticate client: wrong login or password.",
            ),
        }
    }
}

/// Dispatches control channel envelopes against the registry
#[derive(Clone)]
pub struct ControlHandler {
    state: Arc<ServerState>,
}

impl ControlHandler {
    /// Create a handler over the shared state
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Handle one envelope received from `peer`
    pub async fn handle(
        &self,
        envelope: &Envelope,
        peer: SocketAddr,
    ) -> Result<ConnectOutcome, ProtocolViolation> {
        if envelope.message_type != MessageType::Connect {
            return Err(ProtocolViolation::UnsupportedType {
                channel: Channel::Control,
                message_type: envelope.message_type,
            });
        }
        envelope.validate()?;

        let login = envelope.require_login()?;
        let password = envelope.require(InfoKey::Password)?;
        Ok(self.connect(login, password, peer).await)
    }

    /// Authenticate `login` and register it under the address of `peer`
    pub async fn connect(&self, login: &str, password: &str, peer: SocketAddr) -> ConnectOutcome {
        let registry = &self.state.registry;
        let login = Login::from(login);

        if registry.contains(login.as_str()).await {
            tracing::warn!(%login, %peer, "Rejected client authentication: already connected");
            return ConnectOutcome::AlreadyConnected(login);
        }

        if !self.state.credentials.authenticate(login.as_str(), password) {
            tracing::warn!(%login, %peer, "Rejected client authentication: wrong credentials");
            return ConnectOutcome::Rejected(login);
        }

        // A concurrent Connect for the same login may have won since the check above
        let session = Session::new(login.clone(), peer.ip(), peer.port());
        match registry.try_insert(session.clone()).await {
            Ok(()) => {
                tracing::info!(%login, address = %peer.ip(), "Client authenticated");
                ConnectOutcome::Accepted(session)
            }
            Err(_) => {
                tracing::warn!(%login, %peer, "Rejected client authentication: lost connect race");
                ConnectOutcome::AlreadyConnected(login)
            }
        }
    }
}

/// Drive one control connection until the peer closes it, a violation
/// occurs, or the server shuts down.
pub async fn serve_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), ControlError> {
    let handler = ControlHandler::new(Arc::clone(&state));
    let mut framed = Framed::new(stream, EnvelopeCodec::new());
    let mut registered: Vec<Session> = Vec::new();

    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = framed.next() => next,
        };

        let envelope = match next {
            None => break Ok(()),
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => break Err(ControlError::Codec(e)),
        };
        tracing::debug!(%peer, "control <- {}", envelope);

        let outcome = match handler.handle(&envelope, peer).await {
            Ok(outcome) => outcome,
            Err(violation) => break Err(ControlError::Protocol(violation)),
        };
        if let ConnectOutcome::Accepted(session) = &outcome {
            registered.push(session.clone());
        }

        if let Err(e) = framed.send(outcome.reply()).await {
            break Err(ControlError::Codec(e));
        }
    };

    if state.config.release_on_close {
        for session in &registered {
            if state.registry.release(session).await {
                tracing::info!(login = %session.login, "Control connection closed, session released");
            }
        }
    }

    result
}

/// TCP listener accepting control connections
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

impl ControlServer {
    /// Bind the control channel
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<ServerState>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control channel to {}", addr))?;

        Ok(Self {
            listener,
            state,
            cancel,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!("Control channel listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Control channel shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.spawn_connection(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New control connection from {}", peer_addr);

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            match serve_connection(state, socket, peer_addr, cancel).await {
                Ok(()) => {
                    tracing::debug!("Control connection from {} closed", peer_addr);
                }
                Err(ControlError::Protocol(violation)) => {
                    tracing::warn!("Control connection from {} rejected: {}", peer_addr, violation);
                }
                Err(e) => {
                    tracing::warn!("Control connection from {} failed: {}", peer_addr, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use rdv_core::config::ServerConfig;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_state() -> Arc<ServerState> {
        let credentials = StaticCredentials::new();
        credentials.add_user("alice", "p1").unwrap();
        credentials.add_user("bob", "p2").unwrap();
        Arc::new(ServerState::new(ServerConfig::default(), Arc::new(credentials)))
    }

    fn peer(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), port)
    }

    #[tokio::test]
    async fn test_connect_registers_with_peer_address() {
        let state = test_state();
        let handler = ControlHandler::new(Arc::clone(&state));

        let outcome = handler
            .handle(&Envelope::connect("alice", "p1"), peer(10, 51000))
            .await
            .unwrap();
        assert!(matches!(outcome, ConnectOutcome::Accepted(_)));
        assert_eq!(outcome.reply().message_type, MessageType::Ok);

        let session = state.registry.get("alice").await.unwrap();
        assert_eq!(session.address, peer(10, 0).ip());
        assert_eq!(session.signaling_port, 51000);
    }

    #[tokio::test]
    async fn test_duplicate_connect_skips_authentication() {
        let state = test_state();
        let handler = ControlHandler::new(Arc::clone(&state));

        handler.connect("alice", "p1", peer(10, 1)).await;
        let outcome = handler.connect("alice", "wrong", peer(11, 1)).await;

        assert_eq!(outcome, ConnectOutcome::AlreadyConnected(Login::from("alice")));
        assert_eq!(outcome.reply().error_kind(), Some(ErrorKind::AlreadyConnected));
        assert_eq!(state.registry.get("alice").await.unwrap().address, peer(10, 0).ip());
    }

    #[tokio::test]
    async fn test_wrong_password_is_generic_error() {
        let state = test_state();
        let handler = ControlHandler::new(Arc::clone(&state));

        let outcome = handler.connect("alice", "nope", peer(10, 1)).await;
        assert_eq!(outcome.reply().error_kind(), Some(ErrorKind::Generic));
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_connect_single_winner() {
        let state = test_state();
        let handler = ControlHandler::new(Arc::clone(&state));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler.connect("bob", "p2", peer(i, 1000)).await
            }));
        }

        let mut accepted = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                ConnectOutcome::Accepted(_) => accepted += 1,
                ConnectOutcome::AlreadyConnected(_) => duplicates += 1,
                ConnectOutcome::Rejected(_) => panic!("valid credentials rejected"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(duplicates, 7);
    }

    #[tokio::test]
    async fn test_other_types_are_violations() {
        let handler = ControlHandler::new(test_state());

        let result = handler
            .handle(&Envelope::request_list("alice", 4000), peer(1, 1))
            .await;
        assert_eq!(
            result,
            Err(ProtocolViolation::UnsupportedType {
                channel: Channel::Control,
                message_type: MessageType::RequestList,
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_connect_is_violation() {
        let state = test_state();
        let handler = ControlHandler::new(Arc::clone(&state));

        let envelope = Envelope::new(MessageType::Connect).with_info(InfoKey::Login, "alice");
        let result = handler.handle(&envelope, peer(1, 1)).await;
        assert!(matches!(
            result,
            Err(ProtocolViolation::MissingField {
                key: InfoKey::Password,
                ..
            })
        ));
        assert!(state.registry.is_empty().await);
    }
}
