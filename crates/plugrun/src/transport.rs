//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between the guest and host
//! contexts.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about envelopes, ids or
//!   subscriptions. It moves opaque buffers, one message per buffer.
//! - **Duplex**: `send` and `recv` are independent. The channel runs exactly
//!   one reader and one writer against a transport, so implementations only
//!   have to preserve order within each direction.

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the link was torn down.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A frame exceeded the configured size limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A duplex message pipe to the peer context.
///
/// This trait is object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one message to the peer.
    ///
    /// # invariants
    /// - Messages sent by one task arrive in the order they were sent.
    /// - Must not interpret the payload.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message from the peer.
    ///
    /// Returns `Ok(None)` once the peer has closed its side.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending side so the peer observes end-of-stream.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
