//! Client authentication
//!
//! Users are declared in the server config and/or a separate credentials
//! file. Passwords may be stored in clear or as `sha256:<hex>` digests.

mod credentials;

pub use credentials::StaticCredentials;
