//! # Error Taxonomy
//!
//! Every failure a caller can observe. Channel-fatal conditions live in
//! [`ConnectionError`]; everything else is scoped to a single call or
//! subscription and leaves the channel usable.

use std::time::Duration;

use plugwire::RemoteError;
use plugwire::WireError;
use plugwire::code;

use crate::channel::ChannelState;
use crate::channel::Role;
use crate::transport::TransportError;

/// Failures of the channel itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake rejected by peer: {0}")]
    HandshakeRejected(RemoteError),
    #[error("peer origin {0:?} is not accepted")]
    OriginRejected(String),
    #[error("peer speaks protocol {peer}, expected {expected}")]
    ProtocolMismatch { expected: u32, peer: u32 },
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel is closed")]
    Closed,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("outbound queue is full ({0} envelopes)")]
    QueueFull(usize),
    #[error("cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: ChannelState },
    #[error("cannot {op} as {role:?}")]
    WrongRole { op: &'static str, role: Role },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Everything that can go wrong for a caller of the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The host reports no such object. Surfaced, never retried.
    #[error("unknown object {object_id}: {message}")]
    UnknownObject { object_id: String, message: String },
    /// The host ran the method and it failed.
    #[error("{object_id}.{method} failed: {error}")]
    RemoteInvocation { object_id: String, method: String, error: RemoteError },
    /// The host refused to start or stop emitting an event.
    #[error("subscription to {object_id}/{event} failed: {message}")]
    Subscription { object_id: String, event: String, message: String },
    /// A payload could not cross the boundary. Fatal to one call only.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Connection(ConnectionError::Transport(e))
    }
}

impl Error {
    /// Classifies a failed response from the host.
    pub(crate) fn from_remote(object_id: &str, method: &str, error: RemoteError) -> Self {
        if error.has_code(code::UNKNOWN_OBJECT) {
            Self::UnknownObject { object_id: object_id.to_string(), message: error.message }
        } else {
            Self::RemoteInvocation {
                object_id: object_id.to_string(),
                method: method.to_string(),
                error,
            }
        }
    }

    pub(crate) fn subscription(object_id: &str, event: &str, message: impl Into<String>) -> Self {
        Self::Subscription {
            object_id: object_id.to_string(),
            event: event.to_string(),
            message: message.into(),
        }
    }

    /// True if the channel went away underneath the call.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::ConnectionLost(_)))
    }

    /// True for any channel-level failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
