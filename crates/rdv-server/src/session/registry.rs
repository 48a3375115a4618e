//! Session registry
//!
//! The registry is the only shared mutable state in the server. Control
//! connection tasks, the signaling loop and the reaper all go through it,
//! and every method takes the lock exactly once, so each call is atomic
//! with respect to every other call. The underlying map is never handed out.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use rdv_core::Login;

/// Server-side record of one authenticated client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Directory key
    pub login: Login,
    /// Address observed on the control connection; never changes
    pub address: IpAddr,
    /// Port the client last declared for signaling replies
    pub signaling_port: u16,
    /// Last signaling packet attributed to this client
    pub last_activity: Instant,
    /// When the client connected
    pub connected_at: Instant,
}

impl Session {
    /// Create a session that is active as of now
    pub fn new(login: Login, address: IpAddr, signaling_port: u16) -> Self {
        let now = Instant::now();
        Self {
            login,
            address,
            signaling_port,
            last_activity: now,
            connected_at: now,
        }
    }

    /// Where signaling traffic for this client should go
    pub fn signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.signaling_port)
    }

    /// Time since the last activity, as seen at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Directory of authenticated clients keyed by login
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Login, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the session for `login`
    pub async fn get(&self, login: &str) -> Option<Session> {
        self.sessions.read().await.get(login).cloned()
    }

    /// Whether `login` is registered
    pub async fn contains(&self, login: &str) -> bool {
        self.sessions.read().await.contains_key(login)
    }

    /// Store a session, replacing any existing one for the same login
    pub async fn insert(&self, session: Session) -> Option<Session> {
        self.sessions
            .write()
            .await
            .insert(session.login.clone(), session)
    }

    /// Store a session only if its login is free.
    ///
    /// On conflict the rejected session is handed back unchanged.
    pub async fn try_insert(&self, session: Session) -> Result<(), Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.login) {
            return Err(session);
        }
        sessions.insert(session.login.clone(), session);
        Ok(())
    }

    /// Remove `login`; absent logins are a no-op
    pub async fn remove(&self, login: &str) -> Option<Session> {
        self.sessions.write().await.remove(login)
    }

    /// Remove the entry only if it is still the given session (same address
    /// and connect time). A later session for the same login is left alone.
    pub async fn release(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        let same = sessions.get(&session.login).is_some_and(|current| {
            current.address == session.address && current.connected_at == session.connected_at
        });
        if same {
            sessions.remove(&session.login);
        }
        same
    }

    /// Point-in-time copy of all logins, sorted
    pub async fn snapshot(&self) -> Vec<Login> {
        let mut logins: Vec<Login> = self.sessions.read().await.keys().cloned().collect();
        logins.sort();
        logins
    }

    /// Refresh the activity timestamp of `login`
    pub async fn touch(&self, login: &str, at: Instant) -> bool {
        match self.sessions.write().await.get_mut(login) {
            Some(session) => {
                session.last_activity = at;
                true
            }
            None => false,
        }
    }

    /// Refresh every session registered from `address`; returns how many
    pub async fn touch_address(&self, address: IpAddr, at: Instant) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut touched = 0;
        for session in sessions.values_mut().filter(|s| s.address == address) {
            session.last_activity = at;
            touched += 1;
        }
        touched
    }

    /// Record the signaling reply port declared by `login`
    pub async fn set_signaling_port(&self, login: &str, port: u16) -> bool {
        match self.sessions.write().await.get_mut(login) {
            Some(session) => {
                session.signaling_port = port;
                true
            }
            None => false,
        }
    }

    /// Serve a directory listing for `login` in one step: record its reply
    /// port, mark it active as of `at` and snapshot all logins. `None` if
    /// `login` is not registered.
    pub async fn list_for(&self, login: &str, port: u16, at: Instant) -> Option<Vec<Login>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(login)?;
        session.signaling_port = port;
        session.last_activity = at;

        let mut logins: Vec<Login> = sessions.keys().cloned().collect();
        logins.sort();
        Some(logins)
    }

    /// Remove every session idle for strictly longer than `timeout`
    pub async fn remove_idle(&self, now: Instant, timeout: Duration) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();

        sessions.retain(|_, session| {
            if session.idle_for(now) > timeout {
                evicted.push(session.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
