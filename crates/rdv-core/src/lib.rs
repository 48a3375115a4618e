//! rdv-core: Shared types and configuration for the rendezvous server
//!
//! This crate holds the pieces used by both the server and the client:
//! the login identifier, server configuration, and the credential store
//! abstraction consulted during `Connect`.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::ConfigError;
pub use traits::CredentialStore;
pub use types::Login;
