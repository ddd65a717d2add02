//! # Error Definitions
//!
//! Failures of the wire layer itself. These are distinct from [`RemoteError`],
//! which is a failure reported *by* the peer inside a well-formed envelope.
//!
//! [`RemoteError`]: crate::RemoteError

use crate::envelope::Kind;

/// Operational failures while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The bytes were not a valid JSON envelope.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// A field required by the envelope's kind was absent.
    #[error("{kind} envelope is missing `{field}`")]
    MissingField { kind: Kind, field: &'static str },
    /// An envelope of one kind was handed to a reader expecting another.
    #[error("expected a {expected} envelope, got {found}")]
    UnexpectedKind { expected: Kind, found: Kind },
    /// The control body could not be interpreted.
    #[error("invalid control body: {0}")]
    InvalidControl(String),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
