//! rdv-client: Client side of the rendezvous protocol
//!
//! [`RendezvousClient`] authenticates on the control channel, keeps that
//! connection open, and issues signaling requests from its own UDP socket.

pub mod client;
pub mod error;

pub use client::{ClientOptions, PeerAddress, RendezvousClient};
pub use error::ClientError;
