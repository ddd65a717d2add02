//! In-process transport.
//!
//! Connects a guest and a host living in the same process (and every test in
//! this crate) through a pair of tokio mpsc channels.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// One end of an in-memory duplex link.
///
/// Messages sent on one end appear on the other end's `recv()`. Closing an
/// end drops its sender, so the peer's `recv()` yields `None`.
pub struct LocalTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl LocalTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
        };

        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
        };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(TransportError::ConnectionLost("local transport closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("peer dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        self.tx.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_duplex_and_ordered() {
        let (a, b) = LocalTransport::pair();

        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();
        b.send(b"back").await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), b"one");
        assert_eq!(b.recv().await.unwrap().unwrap(), b"two");
        assert_eq!(a.recv().await.unwrap().unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_close_signals_end_of_stream() {
        let (a, b) = LocalTransport::pair();

        a.send(b"last").await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), b"last");
        assert!(b.recv().await.unwrap().is_none());
        assert!(matches!(a.send(b"late").await, Err(TransportError::ConnectionLost(_))));
    }
}
