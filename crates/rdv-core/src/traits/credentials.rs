//! Credential store abstraction

use std::sync::Arc;

/// Read-only login/password lookup consulted by `Connect`.
///
/// Implementations must answer without blocking for long; the control
/// handler calls this inline while the client waits for its reply.
pub trait CredentialStore: Send + Sync {
    /// Whether `password` is valid for `login`
    fn authenticate(&self, login: &str, password: &str) -> bool;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn authenticate(&self, login: &str, password: &str) -> bool {
        (**self).authenticate(login, password)
    }
}
