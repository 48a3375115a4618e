//! Signaling channel (UDP)
//!
//! One receive loop serves every client. Each datagram is handled to
//! completion before the next one is read; a bad datagram is logged and
//! dropped and never stops the loop. Only a socket failure or shutdown
//! ends it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use rdv_core::Login;
use rdv_protocol::{
    decode_datagram, encode_datagram, fits_datagram, Channel, Envelope, ErrorKind, InfoKey,
    MessageType, ProtocolError, ProtocolViolation, MAX_DATAGRAM_SIZE,
};

use crate::state::ServerState;

/// Errors raised while serving the signaling channel
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Datagram is not a valid frame
    #[error("Undecodable datagram: {0}")]
    Decode(#[from] ProtocolError),

    /// Envelope is not acceptable on this channel
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Socket failure; ends the loop
    #[error("Signaling socket failed: {0}")]
    Transport(#[from] io::Error),
}

/// An envelope to send and where to send it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub envelope: Envelope,
    pub destination: SocketAddr,
}

/// Dispatches signaling envelopes against the registry
#[derive(Clone)]
pub struct SignalingHandler {
    state: Arc<ServerState>,
}

impl SignalingHandler {
    /// Create a handler over the shared state
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Decode and handle one datagram from `source`.
    ///
    /// Any session registered from the source address has its activity
    /// refreshed once the datagram decodes, whatever the request turns out
    /// to be. A served `RequestList` also refreshes the requesting login,
    /// wherever it was sent from.
    pub async fn handle_datagram(
        &self,
        datagram: &[u8],
        source: SocketAddr,
    ) -> Result<Option<Reply>, SignalingError> {
        let envelope = decode_datagram(datagram)?;
        tracing::trace!(%source, "signaling <- {}", envelope);

        let touched = self
            .state
            .registry
            .touch_address(source.ip(), Instant::now())
            .await;
        if touched > 0 {
            tracing::trace!(%source, touched, "Refreshed session activity");
        }

        self.handle(&envelope, source).await
    }

    /// Handle one decoded envelope from `source`
    pub async fn handle(
        &self,
        envelope: &Envelope,
        source: SocketAddr,
    ) -> Result<Option<Reply>, SignalingError> {
        match envelope.message_type {
            MessageType::RequestList => self.request_list(envelope, source).await.map(Some),
            MessageType::RequestIp => self.request_ip(envelope, source).await.map(Some),
            MessageType::Disconnect => {
                self.disconnect(envelope).await?;
                Ok(None)
            }
            other => Err(ProtocolViolation::UnsupportedType {
                channel: Channel::Signaling,
                message_type: other,
            }
            .into()),
        }
    }

    async fn request_list(
        &self,
        envelope: &Envelope,
        source: SocketAddr,
    ) -> Result<Reply, SignalingError> {
        envelope.validate()?;
        let login = envelope.require_login()?;
        let port = self.reply_port(envelope, source)?;
        let destination = SocketAddr::new(source.ip(), port);

        let listing = self
            .state
            .registry
            .list_for(login, port, Instant::now())
            .await;

        let envelope = match listing {
            Some(logins) => {
                tracing::debug!(%login, count = logins.len(), "Sending client list");
                let list = Envelope::client_list(
                    logins.into_iter().map(Login::into_inner).collect(),
                    port,
                );
                if fits_datagram(&list)? {
                    list
                } else {
                    tracing::warn!(%login, "Client list does not fit in one datagram");
                    Envelope::error(ErrorKind::Generic, "Directory too large.")
                        .with_info(InfoKey::Login, login)
                }
            }
            None => {
                tracing::debug!(%login, %source, "Client list requested by unknown client");
                client_unknown(login)
            }
        };

        Ok(Reply {
            envelope,
            destination,
        })
    }

    async fn request_ip(
        &self,
        envelope: &Envelope,
        source: SocketAddr,
    ) -> Result<Reply, SignalingError> {
        envelope.validate()?;
        let target = envelope.require_login()?;
        let port = self.reply_port(envelope, source)?;
        let destination = SocketAddr::new(source.ip(), port);
        let requester = envelope.info(InfoKey::Requester).unwrap_or("-");

        let envelope = match self.state.registry.get(target).await {
            Some(session) => {
                tracing::debug!(
                    %requester,
                    %target,
                    peer = %session.signaling_addr(),
                    "Resolved client address"
                );
                Envelope::client_ip(target, session.address, session.signaling_port, port)
            }
            None => {
                tracing::debug!(%requester, %target, "Address requested for unknown client");
                client_unknown(target)
            }
        };

        Ok(Reply {
            envelope,
            destination,
        })
    }

    async fn disconnect(&self, envelope: &Envelope) -> Result<(), SignalingError> {
        envelope.validate()?;
        let login = envelope.require_login()?;

        match self.state.registry.remove(login).await {
            Some(session) => {
                tracing::info!(%login, address = %session.address, "Client disconnected");
            }
            None => {
                tracing::debug!(%login, "Disconnect for unregistered client ignored");
            }
        }
        Ok(())
    }

    /// Port replies go to: the declared `Port`, or the datagram's source
    /// port when declared ports are not trusted.
    fn reply_port(&self, envelope: &Envelope, source: SocketAddr) -> Result<u16, ProtocolViolation> {
        if self.state.config.trust_declared_port {
            envelope.require_port(InfoKey::Port)
        } else {
            Ok(source.port())
        }
    }
}

/// `ClientUnknown` error naming the login it is about
fn client_unknown(login: &str) -> Envelope {
    Envelope::error(ErrorKind::ClientUnknown, "Client unknown, please reconnect.")
        .with_info(InfoKey::Login, login)
}

/// The signaling receive loop
pub struct SignalingServer {
    socket: UdpSocket,
    handler: SignalingHandler,
    cancel: CancellationToken,
}

impl SignalingServer {
    /// Bind the signaling channel
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<ServerState>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind signaling channel to {}", addr))?;

        Ok(Self {
            socket,
            handler: SignalingHandler::new(state),
            cancel,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve datagrams until cancelled or the socket fails
    pub async fn run(self) -> Result<(), SignalingError> {
        tracing::info!("Signaling channel listening on {}", self.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, source) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Signaling channel shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    // ICMP port-unreachable from an earlier reply (Windows)
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        tracing::debug!("Ignoring connection reset on signaling socket");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("Signaling socket receive failed: {}", e);
                        return Err(SignalingError::Transport(e));
                    }
                },
            };

            match self.handler.handle_datagram(&buf[..len], source).await {
                Ok(Some(reply)) => self.send(reply).await,
                Ok(None) => {}
                Err(SignalingError::Decode(e)) => {
                    tracing::warn!(%source, "Dropping undecodable datagram: {}", e);
                }
                Err(e) => {
                    tracing::warn!(%source, "Dropping datagram: {}", e);
                }
            }
        }
    }

    async fn send(&self, reply: Reply) {
        let bytes = match encode_datagram(&reply.envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode {} reply: {}", reply.envelope.message_type, e);
                return;
            }
        };

        tracing::trace!(destination = %reply.destination, "signaling -> {}", reply.envelope);
        if let Err(e) = self.socket.send_to(&bytes, reply.destination).await {
            tracing::warn!(
                "Failed to send {} to {}: {}",
                reply.envelope.message_type,
                reply.destination,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::session::Session;
    use rdv_core::config::ServerConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const ALICE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const BOB_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn state_with(config: ServerConfig) -> Arc<ServerState> {
        Arc::new(ServerState::new(config, Arc::new(StaticCredentials::new())))
    }

    async fn register(state: &ServerState, login: &str, ip: IpAddr, port: u16) {
        state
            .registry
            .insert(Session::new(Login::from(login), ip, port))
            .await;
    }

    fn from(ip: IpAddr, port: u16) -> SocketAddr {
        SocketAddr::new(ip, port)
    }

    #[tokio::test]
    async fn test_request_list_known_client() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        register(&state, "bob", BOB_IP, 2).await;
        let handler = SignalingHandler::new(Arc::clone(&state));

        let reply = handler
            .handle(&Envelope::request_list("alice", 7000), from(ALICE_IP, 9999))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.destination, from(ALICE_IP, 7000));
        assert_eq!(reply.envelope.message_type, MessageType::ClientList);
        assert_eq!(reply.envelope.info(InfoKey::Port), Some("7000"));
        assert_eq!(
            reply.envelope.client_logins().unwrap(),
            &["alice".to_string(), "bob".to_string()]
        );
        assert_eq!(state.registry.get("alice").await.unwrap().signaling_port, 7000);
    }

    #[tokio::test]
    async fn test_request_list_unknown_client() {
        let state = state_with(ServerConfig::default());
        let handler = SignalingHandler::new(state);

        let reply = handler
            .handle(&Envelope::request_list("ghost", 7000), from(ALICE_IP, 9999))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.destination, from(ALICE_IP, 7000));
        assert_eq!(reply.envelope.error_kind(), Some(ErrorKind::ClientUnknown));
    }

    #[tokio::test]
    async fn test_request_ip_resolves_target() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        register(&state, "bob", BOB_IP, 6000).await;
        let handler = SignalingHandler::new(state);

        let reply = handler
            .handle(
                &Envelope::request_ip(Some("alice"), "bob", 7000),
                from(ALICE_IP, 9999),
            )
            .await
            .unwrap()
            .unwrap();

        let envelope = reply.envelope;
        assert_eq!(envelope.message_type, MessageType::ClientIp);
        assert_eq!(envelope.client_address(), Some(BOB_IP));
        assert_eq!(envelope.info(InfoKey::Login), Some("bob"));
        assert_eq!(envelope.info(InfoKey::RequestIpTargetPort), Some("6000"));
        assert_eq!(envelope.info(InfoKey::Port), Some("7000"));
        assert_eq!(reply.destination, from(ALICE_IP, 7000));
    }

    #[tokio::test]
    async fn test_request_ip_unknown_target() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        let handler = SignalingHandler::new(state);

        let reply = handler
            .handle(&Envelope::request_ip(Some("alice"), "bob", 7000), from(ALICE_IP, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.error_kind(), Some(ErrorKind::ClientUnknown));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        let handler = SignalingHandler::new(Arc::clone(&state));

        let first = handler
            .handle(&Envelope::disconnect("alice"), from(ALICE_IP, 1))
            .await
            .unwrap();
        let second = handler
            .handle(&Envelope::disconnect("alice"), from(ALICE_IP, 1))
            .await
            .unwrap();

        assert!(first.is_none());
        assert!(second.is_none());
        assert!(!state.registry.contains("alice").await);
    }

    #[tokio::test]
    async fn test_unsupported_and_malformed_are_violations() {
        let handler = SignalingHandler::new(state_with(ServerConfig::default()));

        let result = handler
            .handle(&Envelope::connect("alice", "p1"), from(ALICE_IP, 1))
            .await;
        assert!(matches!(
            result,
            Err(SignalingError::Protocol(ProtocolViolation::UnsupportedType {
                channel: Channel::Signaling,
                message_type: MessageType::Connect,
            }))
        ));

        let no_port = Envelope::new(MessageType::RequestList).with_info(InfoKey::Login, "alice");
        let result = handler.handle(&no_port, from(ALICE_IP, 1)).await;
        assert!(matches!(
            result,
            Err(SignalingError::Protocol(ProtocolViolation::MissingField {
                key: InfoKey::Port,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_decode_error() {
        let handler = SignalingHandler::new(state_with(ServerConfig::default()));
        let result = handler.handle_datagram(b"\x00garbage", from(ALICE_IP, 1)).await;
        assert!(matches!(result, Err(SignalingError::Decode(_))));
    }

    #[tokio::test]
    async fn test_untrusted_port_uses_source() {
        let config = ServerConfig {
            trust_declared_port: false,
            ..Default::default()
        };
        let state = state_with(config);
        register(&state, "alice", ALICE_IP, 1).await;
        let handler = SignalingHandler::new(Arc::clone(&state));

        let reply = handler
            .handle(&Envelope::request_list("alice", 7000), from(ALICE_IP, 9999))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.destination, from(ALICE_IP, 9999));
        assert_eq!(reply.envelope.info(InfoKey::Port), Some("9999"));
        assert_eq!(state.registry.get("alice").await.unwrap().signaling_port, 9999);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_decoded_datagram_refreshes_activity() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        register(&state, "bob", BOB_IP, 2).await;
        let handler = SignalingHandler::new(Arc::clone(&state));

        tokio::time::advance(Duration::from_secs(60)).await;

        // Even a request the channel rejects counts as liveness
        let bytes = encode_datagram(&Envelope::ok("ping")).unwrap();
        assert!(handler.handle_datagram(&bytes, from(ALICE_IP, 1)).await.is_err());

        let evicted = state
            .registry
            .remove_idle(Instant::now(), Duration::from_secs(30))
            .await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].login.as_str(), "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_list_from_other_address_keeps_login_active() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        register(&state, "bob", BOB_IP, 2).await;
        let handler = SignalingHandler::new(Arc::clone(&state));

        tokio::time::advance(Duration::from_secs(60)).await;

        // Signaling from an address other than the control connection's
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));
        let bytes = encode_datagram(&Envelope::request_list("alice", 7000)).unwrap();
        let reply = handler
            .handle_datagram(&bytes, from(other, 9999))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.message_type, MessageType::ClientList);
        assert_eq!(reply.destination, from(other, 7000));

        let evicted = state
            .registry
            .remove_idle(Instant::now(), Duration::from_secs(30))
            .await;
        let evicted: Vec<&str> = evicted.iter().map(|s| s.login.as_str()).collect();
        assert_eq!(evicted, vec!["bob"]);
        assert!(state.registry.contains("alice").await);
    }

    #[tokio::test]
    async fn test_oversized_directory_answers_generic_error() {
        let state = state_with(ServerConfig::default());
        register(&state, "alice", ALICE_IP, 1).await;
        for i in 0..5000u32 {
            register(&state, &format!("client-{:05}", i), BOB_IP, 2).await;
        }
        let handler = SignalingHandler::new(Arc::clone(&state));

        let reply = handler
            .handle(&Envelope::request_list("alice", 7000), from(ALICE_IP, 9999))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.destination, from(ALICE_IP, 7000));
        assert_eq!(reply.envelope.error_kind(), Some(ErrorKind::Generic));
        assert_eq!(reply.envelope.info(InfoKey::Login), Some("alice"));
        assert!(encode_datagram(&reply.envelope).is_ok());
    }

    #[tokio::test]
    async fn test_client_unknown_names_subject() {
        let handler = SignalingHandler::new(state_with(ServerConfig::default()));

        let reply = handler
            .handle(&Envelope::request_ip(Some("alice"), "bob", 7000), from(ALICE_IP, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.error_kind(), Some(ErrorKind::ClientUnknown));
        assert_eq!(reply.envelope.info(InfoKey::Login), Some("bob"));
    }
}
