//! # Envelopes
//!
//! The single structured message unit exchanged between guest and host.
//!
//! ```text
//! { kind: "request" | "response" | "event" | "control",
//!   id?: string, objectId: string, name: string,
//!   payload?: any, error?: { message, code? } }
//! ```
//!
//! ## Invariants
//! - `request` and `response` envelopes always carry an `id`; `event` and
//!   `control` never do.
//! - `error` only appears on failed responses and rejecting control messages.
//! - Payloads are opaque: nothing in this crate inspects them beyond shape.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::error::WireError;

/// Well-known values for [`RemoteError::code`].
pub mod code {
    /// The host has no object with the requested id.
    pub const UNKNOWN_OBJECT: &str = "unknown_object";
    /// The object exists but does not implement the method.
    pub const UNKNOWN_METHOD: &str = "unknown_method";
    /// The arguments did not fit the method.
    pub const INVALID_ARGUMENTS: &str = "invalid_arguments";
    /// The host refused to start or stop emitting an event.
    pub const SUBSCRIPTION_REJECTED: &str = "subscription_rejected";
    /// The handshake origin was not accepted.
    pub const ORIGIN_REJECTED: &str = "origin_rejected";
    /// The peers speak incompatible protocol versions.
    pub const PROTOCOL_MISMATCH: &str = "protocol_mismatch";
    /// Anything else that went wrong on the remote side.
    pub const INTERNAL: &str = "internal";
}

/// Discriminates what an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
    Control,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Event => "event",
            Kind::Control => "control",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the peer, carried verbatim across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { message: message.into(), code: Some(code.into()) }
    }

    pub fn unknown_object(object_id: &str) -> Self {
        Self::with_code(code::UNKNOWN_OBJECT, format!("no such object: {object_id}"))
    }

    pub fn unknown_method(object_id: &str, method: &str) -> Self {
        Self::with_code(code::UNKNOWN_METHOD, format!("{object_id} has no method {method}"))
    }

    /// Returns true if the code matches `expected`.
    pub fn has_code(&self, expected: &str) -> bool {
        self.code.as_deref() == Some(expected)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "objectId", default)]
    pub object_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Envelope {
    /// A method invocation. `args` travel as a JSON array.
    pub fn request(id: u64, object_id: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind: Kind::Request,
            id: Some(id.to_string()),
            object_id: object_id.into(),
            name: method.into(),
            payload: Some(Value::Array(args)),
            error: None,
        }
    }

    /// The answer to `request`, echoing its id, object and method.
    pub fn response(request: &Envelope, outcome: std::result::Result<Value, RemoteError>) -> Self {
        let (payload, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            kind: Kind::Response,
            id: request.id.clone(),
            object_id: request.object_id.clone(),
            name: request.name.clone(),
            payload,
            error,
        }
    }

    /// An event emitted by the host for `(object_id, name)`.
    pub fn event(object_id: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: Kind::Event,
            id: None,
            object_id: object_id.into(),
            name: name.into(),
            payload: Some(payload),
            error: None,
        }
    }

    /// The request id, required for requests and responses.
    pub fn require_id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or(WireError::MissingField { kind: self.kind, field: "id" })
    }

    /// Fails unless this envelope is of kind `expected`.
    pub fn expect_kind(&self, expected: Kind) -> Result<()> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(WireError::UnexpectedKind { expected, found: self.kind })
        }
    }

    /// Arguments of a request. A missing payload means no arguments and a
    /// non-array payload is treated as a single argument.
    pub fn args(&self) -> Vec<Value> {
        match &self.payload {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        }
    }

    /// The settled outcome carried by a response.
    pub fn outcome(&self) -> std::result::Result<Value, RemoteError> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.payload.clone().unwrap_or(Value::Null)),
        }
    }

    /// Checks the per-kind field requirements.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            Kind::Request | Kind::Response => {
                self.require_id()?;
            }
            Kind::Event | Kind::Control => {}
        }
        Ok(())
    }
}
