//! Global server state

use std::sync::Arc;

use rdv_core::config::ServerConfig;
use rdv_core::CredentialStore;

use crate::session::SessionRegistry;

/// State shared by the control handlers, the signaling loop and the reaper
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Directory of authenticated clients
    pub registry: Arc<SessionRegistry>,
    /// Credential lookup used by `Connect`
    pub credentials: Arc<dyn CredentialStore>,
}

impl ServerState {
    /// Create server state with an empty registry
    pub fn new(config: ServerConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            credentials,
        }
    }

    /// Get the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
