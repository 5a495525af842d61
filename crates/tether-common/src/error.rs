//! Channel error taxonomy.

use crate::cipher::CipherError;
use crate::envelope::EnvelopeError;
use crate::policy::TypeIdentity;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by [`SecureConnection`](crate::channel::SecureConnection)
/// operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// I/O failure on the underlying transport. Connection-fatal.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An inbound envelope's type was denied by the security policy. Its body
    /// was never decoded. The connection must be closed.
    #[error("security policy rejected inbound {identity}")]
    Security {
        /// Identity of the rejected type.
        identity: TypeIdentity,
    },

    /// Malformed or out-of-sync data, including failed decryption.
    #[error("framing error: {0}")]
    Framing(String),

    /// A heartbeat went unacknowledged and the connection was force-closed.
    #[error("liveness timeout: heartbeat not acknowledged in time")]
    LivenessTimeout,

    /// The connection was closed.
    #[error("connection closed ({0})")]
    Closed(CloseReason),

    /// The direction being upgraded is already encrypted.
    #[error("connection is already encrypted")]
    AlreadyEncrypted,
}

impl From<EnvelopeError> for ChannelError {
    fn from(err: EnvelopeError) -> Self {
        Self::Framing(err.to_string())
    }
}

impl From<CipherError> for ChannelError {
    fn from(err: CipherError) -> Self {
        Self::Framing(err.to_string())
    }
}

impl ChannelError {
    /// Whether the connection cannot be used after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::AlreadyEncrypted)
    }
}

/// Why a connection ended. The first reason recorded wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The peer closed its end of the transport.
    PeerClosed,
    /// The heartbeat timed out.
    LivenessTimeout,
    /// A transport or framing failure killed the connection.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::LivenessTimeout => f.write_str("liveness timeout"),
            Self::Failed(detail) => write!(f, "failed: {detail}"),
        }
    }
}

impl From<CloseReason> for ChannelError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::LivenessTimeout => Self::LivenessTimeout,
            other => Self::Closed(other),
        }
    }
}
