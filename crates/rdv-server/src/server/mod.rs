//! Network front ends: the TCP control channel and the UDP signaling channel

mod control;
mod signaling;

pub use control::{serve_connection, ConnectOutcome, ControlError, ControlHandler, ControlServer};
pub use signaling::{Reply, SignalingError, SignalingHandler, SignalingServer};
