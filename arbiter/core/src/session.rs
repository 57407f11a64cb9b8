//! Session Registry
//!
//! Tracks which connections have registered a display name and enforces the
//! uniqueness rules: one active session per display name and one per network
//! origin. Sessions are kept in registration order, which is also the order
//! of the turn queue, so [`SessionRegistry::list`] can feed the roster
//! broadcast directly.
//!
//! The registry does not touch the turn queue itself; the arbiter enqueues a
//! session right after a successful [`SessionRegistry::register`] and
//! dequeues it alongside [`SessionRegistry::remove`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on display name length (characters)
pub const DEFAULT_MAX_NAME_LEN: usize = 32;

/// Unique identifier for a client connection
///
/// Each connection is assigned a unique ID when it connects.
/// This ID is stable for the lifetime of the connection and doubles as the
/// session id once the connection registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value (for testing or deserialization)
    #[must_use]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Reasons a registration is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Another active session already uses this display name
    #[error("display name '{0}' is already taken")]
    NameTaken(String),

    /// Another active session already comes from this origin
    #[error("a session from {0} is already active")]
    OriginTaken(String),

    /// This connection already holds a session
    #[error("this connection is already registered")]
    AlreadyRegistered,

    /// Display name is empty or too long
    #[error("invalid display name: {0}")]
    InvalidName(String),
}

/// An operator identity bound to one live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Connection-scoped id
    pub id: ConnectionId,
    /// Name chosen by the operator (trimmed)
    pub display_name: String,
    /// Network origin of the connection
    pub origin: String,
    /// When the session registered
    pub registered_at: Instant,
}

/// Registry of active sessions
#[derive(Debug)]
pub struct SessionRegistry {
    /// Sessions in registration order
    sessions: Vec<Session>,
    /// Longest accepted display name
    max_name_len: usize,
    /// Whether two sessions may share an origin
    unique_origins: bool,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NAME_LEN, true)
    }
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(max_name_len: usize, unique_origins: bool) -> Self {
        Self {
            sessions: Vec::new(),
            max_name_len,
            unique_origins,
        }
    }

    /// Register a display name for a connection
    ///
    /// # Errors
    ///
    /// Returns a [`RegistrationError`] and leaves the registry untouched when
    /// the name is invalid or taken, the origin is taken, or the connection
    /// already has a session.
    pub fn register(
        &mut self,
        id: ConnectionId,
        origin: &str,
        display_name: &str,
    ) -> Result<Session, RegistrationError> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(RegistrationError::InvalidName("name is empty".into()));
        }
        if name.chars().count() > self.max_name_len {
            return Err(RegistrationError::InvalidName(format!(
                "name is longer than {} characters",
                self.max_name_len
            )));
        }
        if self.contains(id) {
            return Err(RegistrationError::AlreadyRegistered);
        }
        if self.sessions.iter().any(|s| s.display_name == name) {
            return Err(RegistrationError::NameTaken(name.to_string()));
        }
        if self.unique_origins && self.sessions.iter().any(|s| s.origin == origin) {
            return Err(RegistrationError::OriginTaken(origin.to_string()));
        }

        let session = Session {
            id,
            display_name: name.to_string(),
            origin: origin.to_string(),
            registered_at: Instant::now(),
        };
        self.sessions.push(session.clone());

        tracing::info!(
            connection_id = %id,
            session = %session.display_name,
            origin = %session.origin,
            "Session registered"
        );
        Ok(session)
    }

    /// Remove a session (no-op if absent)
    pub fn remove(&mut self, id: ConnectionId) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        let session = self.sessions.remove(index);
        tracing::info!(
            connection_id = %id,
            session = %session.display_name,
            "Session removed"
        );
        Some(session)
    }

    /// Display names in queue order
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|s| s.display_name.clone())
            .collect()
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Live display name for a session
    #[must_use]
    pub fn display_name(&self, id: ConnectionId) -> Option<&str> {
        self.get(id).map(|s| s.display_name.as_str())
    }

    /// Check if a connection has a session
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.iter().any(|s| s.id == id)
    }

    /// Number of active sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
