//! Core domain types

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Unique identifier of a client in the directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Login(pub String);

impl Login {
    /// Create a new login
    pub fn new(login: impl Into<String>) -> Self {
        Self(login.into())
    }

    /// Get the raw login string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the raw string
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Login {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for Login {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Login {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_login_display() {
        assert_eq!(format!("{}", Login::new("alice")), "alice");
    }

    #[test]
    fn test_login_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Login::from("alice"), 1);
        assert_eq!(map.get("alice"), Some(&1));
        assert_eq!(map.get("bob"), None);
    }

    #[test]
    fn test_login_ordering() {
        let mut logins = vec![Login::from("carol"), Login::from("alice"), Login::from("bob")];
        logins.sort();
        assert_eq!(logins[0].as_str(), "alice");
        assert_eq!(logins[2].as_str(), "carol");
    }
}
