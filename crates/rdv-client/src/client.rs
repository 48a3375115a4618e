//! Rendezvous client
//!
//! The control connection stays open for the life of the client; the server
//! may treat its closure as an implicit disconnect. Signaling requests go out
//! from a UDP socket bound to the same local address as the control
//! connection, so the server attributes them to this client. Requests are
//! strictly one at a time: every request method takes `&mut self`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rdv_core::Login;
use rdv_protocol::{
    decode_datagram, encode_datagram, Envelope, EnvelopeCodec, ErrorKind, InfoKey, MessageType,
    ProtocolViolation, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

use crate::error::{ClientError, Result};

/// Tunables for [`RendezvousClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long to wait for any single reply
    pub reply_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// Where a peer can be reached, as resolved by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub login: Login,
    pub address: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.login, self.socket_addr())
    }
}

/// An authenticated connection to a rendezvous server
pub struct RendezvousClient {
    login: Login,
    control: Framed<TcpStream, EnvelopeCodec>,
    socket: UdpSocket,
    signaling_addr: SocketAddr,
    options: ClientOptions,
}

impl RendezvousClient {
    /// Connect and authenticate with default options
    pub async fn connect(
        control_addr: SocketAddr,
        signaling_addr: SocketAddr,
        login: &str,
        password: &str,
    ) -> Result<Self> {
        Self::connect_with(
            control_addr,
            signaling_addr,
            login,
            password,
            ClientOptions::default(),
        )
        .await
    }

    /// Connect and authenticate
    pub async fn connect_with(
        control_addr: SocketAddr,
        signaling_addr: SocketAddr,
        login: &str,
        password: &str,
        options: ClientOptions,
    ) -> Result<Self> {
        tracing::debug!("Connecting to control channel at {}", control_addr);

        let stream = TcpStream::connect(control_addr).await?;
        let local_ip = stream.local_addr()?.ip();
        let mut control = Framed::new(stream, EnvelopeCodec::new());

        control.send(Envelope::connect(login, password)).await?;

        let reply = match timeout(options.reply_timeout, control.next()).await {
            Err(_) => return Err(ClientError::Timeout(options.reply_timeout)),
            Ok(None) => return Err(ClientError::ConnectionClosed),
            Ok(Some(reply)) => reply?,
        };
        reply.validate()?;

        match reply.message_type {
            MessageType::Ok => {}
            MessageType::Error => {
                return Err(match reply.error_kind() {
                    Some(ErrorKind::AlreadyConnected) => {
                        ClientError::AlreadyConnected(login.to_string())
                    }
                    _ => ClientError::AuthenticationFailed(reply_text(&reply)),
                });
            }
            other => {
                return Err(ClientError::UnexpectedReply {
                    expected: MessageType::Ok,
                    actual: other,
                })
            }
        }

        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        tracing::info!(
            login,
            signaling = %socket.local_addr()?,
            "Authenticated with rendezvous server"
        );

        Ok(Self {
            login: Login::from(login),
            control,
            socket,
            signaling_addr,
            options,
        })
    }

    /// Login this client authenticated as
    pub fn login(&self) -> &Login {
        &self.login
    }

    /// Local address of the signaling socket (the port declared to the server)
    pub fn local_signaling_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Logins of every client currently registered, including this one
    pub async fn request_list(&mut self) -> Result<Vec<Login>> {
        let port = self.local_signaling_addr()?.port();
        let request = Envelope::request_list(self.login.as_str(), port);
        let subject = self.login.to_string();

        let reply = self
            .exchange(request, MessageType::ClientList, &subject, |_| true)
            .await?;

        Ok(reply
            .client_logins()
            .unwrap_or(&[])
            .iter()
            .map(|login| Login::from(login.as_str()))
            .collect())
    }

    /// Resolve where `target` can be reached
    pub async fn request_ip(&mut self, target: &str) -> Result<PeerAddress> {
        let port = self.local_signaling_addr()?.port();
        let request = Envelope::request_ip(Some(self.login.as_str()), target, port);

        let reply = self
            .exchange(request, MessageType::ClientIp, target, |reply| {
                reply.info(InfoKey::Login) == Some(target)
            })
            .await?;

        let address = reply
            .client_address()
            .ok_or(ProtocolViolation::MissingPayload {
                message_type: MessageType::ClientIp,
                expected: "client address",
            })?;
        let port = reply.require_port(InfoKey::RequestIpTargetPort)?;

        Ok(PeerAddress {
            login: Login::from(target),
            address,
            port,
        })
    }

    /// Leave the directory and close the control connection
    pub async fn disconnect(mut self) -> Result<()> {
        let bytes = encode_datagram(&Envelope::disconnect(self.login.as_str()))?;
        self.socket.send_to(&bytes, self.signaling_addr).await?;

        if let Err(e) = self.control.close().await {
            tracing::debug!("Error closing control connection: {}", e);
        }
        tracing::info!(login = %self.login, "Disconnected from rendezvous server");
        Ok(())
    }

    /// Send a `RequestList` every `interval` until cancelled, keeping the
    /// session from being evicted.
    ///
    /// A missed reply is logged and retried on the next tick. Any other
    /// failure, including the server forgetting this client, ends the loop.
    pub async fn keep_alive(
        &mut self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.request_list().await {
                Ok(logins) => tracing::trace!("Keep-alive: {} clients online", logins.len()),
                Err(ClientError::Timeout(wait)) => {
                    tracing::warn!("Keep-alive got no reply within {:?}", wait);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one signaling request and wait for the matching reply
    async fn exchange(
        &mut self,
        request: Envelope,
        expected: MessageType,
        subject: &str,
        matches: impl Fn(&Envelope) -> bool,
    ) -> Result<Envelope> {
        let bytes = encode_datagram(&request)?;
        self.socket.send_to(&bytes, self.signaling_addr).await?;
        tracing::trace!("signaling -> {}", request);

        let wait = self.options.reply_timeout;
        match timeout(wait, self.await_reply(expected, subject, matches)).await {
            Ok(reply) => reply,
            Err(_) => Err(ClientError::Timeout(wait)),
        }
    }

    async fn await_reply(
        &self,
        expected: MessageType,
        subject: &str,
        matches: impl Fn(&Envelope) -> bool,
    ) -> Result<Envelope> {
        let mut buf = vec![0u8; HEADER_SIZE + MAX_PAYLOAD_SIZE];

        loop {
            let (len, source) = self.socket.recv_from(&mut buf).await?;
            if source != self.signaling_addr {
                tracing::debug!("Ignoring datagram from {}", source);
                continue;
            }

            let reply = match decode_datagram(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("Dropping undecodable reply: {}", e);
                    continue;
                }
            };
            tracing::trace!("signaling <- {}", reply);

            if reply.message_type == MessageType::Error {
                // Errors name the login they concern; one about another
                // login answers an earlier request
                if reply.info(InfoKey::Login).is_some_and(|login| login != subject) {
                    tracing::debug!("Ignoring stale error reply: {}", reply);
                    continue;
                }
                return Err(match reply.error_kind() {
                    Some(ErrorKind::ClientUnknown) => ClientError::ClientUnknown(subject.to_string()),
                    _ => ClientError::Server(reply_text(&reply)),
                });
            }
            if reply.message_type != expected || !matches(&reply) {
                tracing::debug!("Ignoring stale {} reply", reply.message_type);
                continue;
            }

            reply.validate()?;
            return Ok(reply);
        }
    }
}

fn reply_text(reply: &Envelope) -> String {
    reply
        .text
        .clone()
        .unwrap_or_else(|| reply.message_type.to_string())
}
