//! Connection authentication.
//!
//! Every connection gets a [`Session`] that starts out unauthenticated.
//! The first `AUTH` decides its fate: a match authenticates it for the
//! rest of the connection, a mismatch closes it. There is no retry.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use tracing::{info, warn};
use uuid::Uuid;

use keylock_common::{Error, Result};
use keylock_crypto::{constant_time_eq, secret_digest};

/// Checks passwords presented by clients.
///
/// Only a digest of the configured password is kept.
pub struct AuthGateway {
    digest: [u8; 32],
}

impl AuthGateway {
    pub fn new(password: &[u8]) -> Self {
        Self {
            digest: secret_digest(password),
        }
    }

    /// Compare `supplied` with the configured password in constant time.
    pub fn verify(&self, supplied: &[u8]) -> bool {
        constant_time_eq(&self.digest, &secret_digest(supplied))
    }
}

impl fmt::Debug for AuthGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthGateway([REDACTED])")
    }
}

/// Unique id of a session, used to correlate log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authentication state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `AUTH`.
    Unauthenticated,
    /// `AUTH` succeeded; vault operations are allowed.
    Authenticated,
    /// `AUTH` failed or the connection is going away.
    Closed,
}

/// Per-connection session.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    peer: SocketAddr,
    state: SessionState,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            handle: SessionHandle::new(),
            peer,
            state: SessionState::Unauthenticated,
            created_at: Utc::now(),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Handle an `AUTH` attempt.
    ///
    /// # Postconditions
    /// - On success the session is `Authenticated`
    /// - On failure the session is `Closed` and must not be reused
    ///
    /// # Errors
    /// - `AuthFailure` if the password does not match or the session is closed
    /// - `InvalidInput` if the session is already authenticated; it stays so
    pub fn authenticate(&mut self, gateway: &AuthGateway, supplied: &[u8]) -> Result<()> {
        match self.state {
            SessionState::Unauthenticated => {
                if gateway.verify(supplied) {
                    self.state = SessionState::Authenticated;
                    info!(peer = %self.peer, session = %self.handle, "Session authenticated");
                    Ok(())
                } else {
                    self.state = SessionState::Closed;
                    warn!(peer = %self.peer, session = %self.handle, "Authentication failed");
                    Err(Error::AuthFailure)
                }
            }
            SessionState::Authenticated => Err(Error::InvalidInput(
                "Session is already authenticated".to_string(),
            )),
            SessionState::Closed => Err(Error::AuthFailure),
        }
    }

    /// Check that vault operations are allowed.
    ///
    /// # Errors
    /// - `Unauthorized` unless the session is authenticated
    pub fn authorize(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    /// Mark the session closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
