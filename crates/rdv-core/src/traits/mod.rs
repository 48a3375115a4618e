//! Collaborator traits

mod credentials;

pub use credentials::CredentialStore;
