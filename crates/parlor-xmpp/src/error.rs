//! Error types for the XMPP client.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;

/// XMPP client errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error on the underlying socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel could not be opened, was closed by the peer, or failed mid-stream
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS upgrade failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server rejected a negotiation step or sent an unexpected reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SASL exchange failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server lacks a required feature (e.g. MUC)
    #[error("Capability error: {0}")]
    Capability(String),

    /// No matching stanza arrived before the deadline
    #[error("Timed out after {waited:?} waiting for a server reply")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// Malformed markup from the server
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation called in the wrong connection state
    #[error("Invalid state: expected {expected:?}, connection is {actual:?}")]
    InvalidState {
        /// State the operation requires
        expected: ConnectionState,
        /// State the connection is in
        actual: ConnectionState,
    },

    /// Connection was explicitly disconnected and cannot be reused
    #[error("Connection has been disconnected")]
    Disconnected,

    /// Operation is declared but has no implementation
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

impl XmppError {
    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Create a new capability error.
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    /// Create a new decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Channel-level fault: socket, TLS, peer hang-up, or a torn-down connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Transport(_) | Self::Tls(_) | Self::Disconnected
        )
    }

    /// Server-level fault: rejected step, failed SASL, or stream error.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::AuthenticationFailed(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
