//! Server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Default control channel (TCP) port
pub const DEFAULT_CONTROL_PORT: u16 = 8001;

/// Default signaling channel (UDP) port
pub const DEFAULT_SIGNALING_PORT: u16 = 8002;

/// Configuration for the rendezvous server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control channel listens on
    pub control_bind: String,

    /// Address the signaling channel is bound to
    pub signaling_bind: String,

    /// Idle time after which a session is evicted; 0 disables eviction
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,

    /// How often the reaper sweeps the registry
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,

    /// Reply to the port a client declares instead of the datagram source port
    pub trust_declared_port: bool,

    /// Drop a session when the control connection that created it closes
    pub release_on_close: bool,

    /// Optional TOML file with additional `[users]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,

    /// Inline users: login -> password (plain or `sha256:<hex>`)
    pub users: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_bind: format!("0.0.0.0:{}", DEFAULT_CONTROL_PORT),
            signaling_bind: format!("0.0.0.0:{}", DEFAULT_SIGNALING_PORT),
            session_timeout: Duration::ZERO,
            reap_interval: Duration::from_secs(5),
            trust_declared_port: true,
            release_on_close: false,
            credentials_file: None,
            users: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Whether idle sessions are ever evicted
    pub fn eviction_enabled(&self) -> bool {
        !self.session_timeout.is_zero()
    }

    /// Parsed control channel address
    pub fn control_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind("control_bind", &self.control_bind)
    }

    /// Parsed signaling channel address
    pub fn signaling_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind("signaling_bind", &self.signaling_bind)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control_addr()?;
        self.signaling_addr()?;

        if self.eviction_enabled() && self.reap_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reap_interval must be at least 1 second when session_timeout is set".into(),
            ));
        }

        if self.users.keys().any(|login| login.is_empty()) {
            return Err(ConfigError::Invalid("users: empty login".into()));
        }

        Ok(())
    }
}

fn parse_bind(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}: {:?} is not ip:port ({})", field, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.control_addr().unwrap().port(), DEFAULT_CONTROL_PORT);
        assert_eq!(config.signaling_addr().unwrap().port(), DEFAULT_SIGNALING_PORT);
        assert!(!config.eviction_enabled());
        assert!(config.trust_declared_port);
        assert!(!config.release_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            session_timeout = 30

            [users]
            alice = "p1"
            "#,
        )
        .unwrap();

        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.reap_interval, Duration::from_secs(5));
        assert_eq!(config.control_bind, "0.0.0.0:8001");
        assert_eq!(config.users.len(), 1);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let config = ServerConfig {
            signaling_bind: "not-an-address".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_reap_interval_with_timeout_rejected() {
        let config = ServerConfig {
            session_timeout: Duration::from_secs(10),
            reap_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let disabled = ServerConfig {
            reap_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(disabled.validate().is_ok());
    }
}
