//! Static credential store

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use rdv_core::config::{self, ServerConfig};
use rdv_core::{ConfigError, CredentialStore};

const SHA256_PREFIX: &str = "sha256:";

/// Stored form of a password
#[derive(Clone, PartialEq, Eq)]
enum Secret {
    Plain(String),
    Sha256([u8; 32]),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Plain(_) => f.write_str("Plain(***)"),
            Secret::Sha256(_) => f.write_str("Sha256(***)"),
        }
    }
}

impl Secret {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.strip_prefix(SHA256_PREFIX) {
            Some(digest) => {
                let bytes = hex::decode(digest.trim())
                    .map_err(|e| ConfigError::Invalid(format!("bad sha256 digest: {}", e)))?;
                let digest: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
                    ConfigError::Invalid(format!("sha256 digest has {} bytes, expected 32", b.len()))
                })?;
                Ok(Secret::Sha256(digest))
            }
            None => Ok(Secret::Plain(raw.to_string())),
        }
    }

    fn matches(&self, password: &str) -> bool {
        match self {
            Secret::Plain(expected) => constant_time_eq(password.as_bytes(), expected.as_bytes()),
            Secret::Sha256(expected) => {
                let provided = Sha256::digest(password.as_bytes());
                constant_time_eq(provided.as_slice(), expected)
            }
        }
    }
}

/// Layout of a standalone credentials file
#[derive(Debug, Default, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    users: HashMap<String, String>,
}

/// In-memory login/password table
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: DashMap<String, Secret>,
}

impl StaticCredentials {
    /// Create an empty store (every `authenticate` fails)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the store described by the server config: inline `[users]`
    /// first, then the optional credentials file (which wins on conflicts).
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let store = Self::new();
        store.extend(&config.users)?;

        if let Some(path) = &config.credentials_file {
            store.load_file(&expand_home(path))?;
        }

        Ok(store)
    }

    /// Load users from a TOML file with a `[users]` table
    pub fn load_file(&self, path: &Path) -> Result<usize, ConfigError> {
        tracing::info!("Loading credentials from {:?}", path);

        let file: CredentialsFile = config::load_config(path)?;
        let count = file.users.len();
        self.extend(&file.users)?;

        tracing::info!("Loaded {} users from {:?}", count, path);
        Ok(count)
    }

    /// Add or replace one user; `password` may be `sha256:<hex>`
    pub fn add_user(&self, login: &str, password: &str) -> Result<(), ConfigError> {
        if login.is_empty() {
            return Err(ConfigError::Invalid("empty login in credentials".into()));
        }
        let secret = Secret::parse(password)
            .map_err(|e| ConfigError::Invalid(format!("user {}: {}", login, e)))?;
        self.users.insert(login.to_string(), secret);
        Ok(())
    }

    /// Number of known users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if there are no users
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn extend(&self, users: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (login, password) in users {
            self.add_user(login, password)?;
        }
        Ok(())
    }
}

impl CredentialStore for StaticCredentials {
    fn authenticate(&self, login: &str, password: &str) -> bool {
        match self.users.get(login) {
            Some(secret) => secret.matches(password),
            None => false,
        }
    }
}

/// Compare without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
