//! # Control Messages
//!
//! Protocol-management traffic: the handshake, event emission start/stop and
//! their confirmations, orderly close, and log-level hints.
//!
//! The body travels in the envelope `payload` as `{"op": ..., ...}`. For
//! `start`, `stop`, `ack` and `reject` the `(objectId, name)` of the envelope
//! name the event pair; for everything else `name` repeats the op tag.
//! Reasons for `hello_reject` and `reject` travel in the envelope `error`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::envelope::Envelope;
use crate::envelope::Kind;
use crate::envelope::RemoteError;
use crate::error::Result;
use crate::error::WireError;

/// Version spoken by this crate. Peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// A decoded control body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Control {
    /// Guest → host: open the channel, announcing the guest's origin.
    Hello { origin: String, protocol: u32 },
    /// Host → guest: handshake accepted, announcing the host's origin.
    HelloAck { origin: String, protocol: u32 },
    /// Host → guest: handshake refused.
    HelloReject,
    /// Guest → host: begin emitting the named event.
    Start,
    /// Guest → host: stop emitting the named event.
    Stop,
    /// Host → guest: the last start/stop for the pair was honored.
    Ack,
    /// Host → guest: the last start/stop for the pair was refused.
    Reject,
    /// Either side: the channel is going away.
    Close,
    /// Guest → host: adjust the host's logging verbosity. Never answered.
    LogLevel { level: String },
}

impl Control {
    /// The `op` tag as it appears on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Control::Hello { .. } => "hello",
            Control::HelloAck { .. } => "hello_ack",
            Control::HelloReject => "hello_reject",
            Control::Start => "start",
            Control::Stop => "stop",
            Control::Ack => "ack",
            Control::Reject => "reject",
            Control::Close => "close",
            Control::LogLevel { .. } => "log_level",
        }
    }

    /// The `{"op": ..}` payload carried by a control envelope.
    pub fn to_value(&self) -> Value {
        match self {
            Control::Hello { origin, protocol } | Control::HelloAck { origin, protocol } => {
                json!({ "op": self.tag(), "origin": origin, "protocol": protocol })
            }
            Control::LogLevel { level } => json!({ "op": self.tag(), "level": level }),
            _ => json!({ "op": self.tag() }),
        }
    }

    /// True for the messages that address an `(objectId, event)` pair.
    pub fn is_pair_scoped(&self) -> bool {
        matches!(self, Control::Start | Control::Stop | Control::Ack | Control::Reject)
    }

    /// Wraps a channel-scoped body (`hello`, `close`, ...) in an envelope.
    pub fn into_envelope(self) -> Envelope {
        let name = self.tag().to_string();
        Envelope::control(String::new(), name, self, None)
    }

    /// Wraps a pair-scoped body (`start`, `stop`, `ack`, `reject`).
    pub fn for_pair(self, object_id: impl Into<String>, event: impl Into<String>) -> Envelope {
        Envelope::control(object_id.into(), event.into(), self, None)
    }
}

impl Envelope {
    /// Builds a control envelope with an optional error reason.
    pub fn control(object_id: String, name: String, body: Control, error: Option<RemoteError>) -> Self {
        Self {
            kind: Kind::Control,
            id: None,
            object_id,
            name,
            payload: Some(body.to_value()),
            error,
        }
    }

    /// A `hello_reject` carrying the refusal reason.
    pub fn hello_reject(reason: RemoteError) -> Self {
        Self::control(String::new(), "hello_reject".into(), Control::HelloReject, Some(reason))
    }

    /// A `reject` for the pair carrying the refusal reason.
    pub fn reject(object_id: impl Into<String>, event: impl Into<String>, reason: RemoteError) -> Self {
        Self::control(object_id.into(), event.into(), Control::Reject, Some(reason))
    }

    /// Decodes the control body of this envelope.
    pub fn control_body(&self) -> Result<Control> {
        self.expect_kind(Kind::Control)?;
        let payload = self
            .payload
            .as_ref()
            .ok_or(WireError::MissingField { kind: Kind::Control, field: "payload" })?;
        Control::deserialize(payload).map_err(|e| WireError::InvalidControl(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_body_is_tagged_by_op() {
        let env = Control::Hello { origin: "https://guest.example".into(), protocol: PROTOCOL_VERSION }
            .into_envelope();

        let payload = env.payload.clone().unwrap();
        assert_eq!(payload["op"], "hello");
        assert_eq!(payload["origin"], "https://guest.example");
        assert_eq!(env.name, "hello");
        assert!(env.id.is_none());
    }

    #[test]
    fn test_payload_matches_serde_for_every_op() {
        let all = [
            Control::Hello { origin: "https://guest.example".into(), protocol: PROTOCOL_VERSION },
            Control::HelloAck { origin: "https://host.example".into(), protocol: PROTOCOL_VERSION },
            Control::HelloReject,
            Control::Start,
            Control::Stop,
            Control::Ack,
            Control::Reject,
            Control::Close,
            Control::LogLevel { level: "debug".into() },
        ];
        for control in all {
            assert_eq!(control.to_value(), serde_json::to_value(&control).unwrap());
            let env = control.clone().for_pair("loan", "change");
            assert_eq!(env.control_body().unwrap(), control);
        }
    }

    #[test]
    fn test_pair_scoped_controls_carry_the_pair() {
        let env = Control::Start.for_pair("loan", "change");
        assert_eq!(env.object_id, "loan");
        assert_eq!(env.name, "change");
        assert_eq!(env.control_body().unwrap(), Control::Start);
        assert!(Control::Start.is_pair_scoped());
        assert!(!Control::Close.is_pair_scoped());
    }

    #[test]
    fn test_reject_keeps_reason_in_error() {
        let env = Envelope::reject("loan", "change", RemoteError::new("not allowed"));
        assert_eq!(env.control_body().unwrap(), Control::Reject);
        assert_eq!(env.error.unwrap().message, "not allowed");
    }

    #[test]
    fn test_control_body_rejects_unknown_op() {
        let mut env = Control::Close.into_envelope();
        env.payload = Some(serde_json::json!({ "op": "explode" }));
        assert!(matches!(env.control_body(), Err(WireError::InvalidControl(_))));
    }

    #[test]
    fn test_control_body_on_event_is_unexpected_kind() {
        let env = Envelope::event("loan", "change", serde_json::json!({}));
        assert!(matches!(
            env.control_body(),
            Err(WireError::UnexpectedKind { expected: Kind::Control, found: Kind::Event })
        ));
    }
}
