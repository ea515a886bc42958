//! CONNECT handshake: secret policy and per-connection session state.
//!
//! The initiator sends CONNECT with a `secret` and optionally its own
//! `instance`. The receiver checks the secret against its [`SecretPolicy`]
//! and moves the [`Session`] to `Authenticated` or `Rejected`:
//!
//! ```text
//! Opened -> Authenticating -> Authenticated -> Closed
//!                          \-> Rejected     -> Closed
//! ```
//!
//! Only authenticated sessions may carry operations other than CONNECT.

use crate::error::ProtocolError;
use crate::protocol::{ConnectRequest, Operation};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid secret")]
    InvalidSecret,
    #[error("registering an instance requires the cluster secret")]
    RegistrationDenied,
}

/// Who authenticated on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Presented the cluster secret; may register instances
    ClusterPeer,
    /// Presented the client secret; may not register
    Client,
}

/// Secrets a node accepts on CONNECT.
///
/// The cluster secret is shared by trackers and storage nodes. The optional
/// client secret lets anonymous clients in without granting them the right
/// to register an instance.
#[derive(Debug, Clone)]
pub struct SecretPolicy {
    cluster_secret: String,
    client_secret: Option<String>,
}

impl SecretPolicy {
    pub fn new(cluster_secret: impl Into<String>) -> Self {
        Self {
            cluster_secret: cluster_secret.into(),
            client_secret: None,
        }
    }

    pub fn with_client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Check a CONNECT request. The expected secret depends on whether the
    /// request carries an instance.
    pub fn verify(&self, request: &ConnectRequest) -> Result<PeerKind, AuthError> {
        if secrets_match(&self.cluster_secret, &request.secret) {
            return Ok(PeerKind::ClusterPeer);
        }
        match &self.client_secret {
            Some(client) if secrets_match(client, &request.secret) => {
                if request.instance.is_some() {
                    Err(AuthError::RegistrationDenied)
                } else {
                    Ok(PeerKind::Client)
                }
            }
            _ => Err(AuthError::InvalidSecret),
        }
    }
}

fn secrets_match(expected: &str, presented: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// Handshake state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Authenticating,
    Authenticated,
    Rejected,
    Closed,
}

/// Server-side view of a connection's handshake progress.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    peer: Option<PeerKind>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Opened,
            peer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Kind of peer, once authenticated.
    pub fn peer(&self) -> Option<PeerKind> {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Check whether `operation` may run in the current state.
    ///
    /// Clients may upload but never read the registry, since instance
    /// descriptors carry the cluster secret.
    pub fn authorize(&self, operation: Operation) -> Result<(), ProtocolError> {
        match (self.state, operation) {
            (SessionState::Opened | SessionState::Authenticated, Operation::Connect) => Ok(()),
            (SessionState::Authenticated, Operation::SyncInstances)
                if self.peer == Some(PeerKind::Client) =>
            {
                Err(ProtocolError::Forbidden(operation))
            }
            (SessionState::Authenticated, _) => Ok(()),
            _ => Err(ProtocolError::Unauthorized(operation)),
        }
    }

    /// A CONNECT arrived. Also used for re-registration on an
    /// authenticated channel.
    pub fn begin_authentication(&mut self) {
        if matches!(self.state, SessionState::Opened | SessionState::Authenticated) {
            self.state = SessionState::Authenticating;
        }
    }

    pub fn accept(&mut self, peer: PeerKind) {
        if self.state == SessionState::Authenticating {
            self.state = SessionState::Authenticated;
            self.peer = Some(peer);
        }
    }

    pub fn reject(&mut self) {
        if self.state == SessionState::Authenticating {
            self.state = SessionState::Rejected;
            self.peer = None;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
