//! rdv-server: Rendezvous directory server
//!
//! Clients authenticate over a TCP control channel and are then reachable
//! through a UDP signaling channel, where they can list the other connected
//! clients, resolve a peer's address, and disconnect. Idle clients are
//! evicted by a background reaper when a session timeout is configured.

pub mod auth;
pub mod server;
pub mod session;
pub mod state;

pub use state::ServerState;
