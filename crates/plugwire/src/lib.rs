//! # plugwire
//!
//! The wire vocabulary shared by both ends of a plugbridge channel.
//!
//! ## Architecture
//!
//! - [`Envelope`]: the one message shape (`request`, `response`, `event`, `control`).
//! - [`Control`]: typed bodies for protocol-management messages.
//! - [`codec`]: bytes in, envelopes out.
//!
//! Application payloads are `serde_json::Value`s and pass through untouched.

pub mod codec;
pub mod control;
pub mod envelope;
pub mod error;

pub use codec::decode;
pub use codec::encode;
pub use control::Control;
pub use control::PROTOCOL_VERSION;
pub use envelope::Envelope;
pub use envelope::Kind;
pub use envelope::RemoteError;
pub use envelope::code;
pub use error::Result;
pub use error::WireError;
