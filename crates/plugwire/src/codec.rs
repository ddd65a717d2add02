//! # Codec
//!
//! Turns envelopes into bytes and back. The encoding is JSON; transports only
//! ever see opaque buffers.
//!
//! ## Invariants
//! - `decode` never panics on arbitrary input.
//! - Unknown top-level fields are ignored for forward compatibility.
//! - A decoded envelope has passed [`Envelope::validate`].

use crate::envelope::Envelope;
use crate::error::Result;

/// Encodes an envelope into a fresh buffer.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decodes and validates an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    envelope.validate()?;
    Ok(envelope)
}
