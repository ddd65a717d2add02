//! # Stream Transport
//!
//! Carries envelopes over any async byte stream (pipes, Unix sockets, TCP).
//!
//! ## Wire Format
//! - Length: u32, little-endian, number of bytes that follow
//! - Data: exactly one encoded envelope
//!
//! A clean end-of-stream between frames is reported as `Ok(None)`; an
//! end-of-stream inside a frame is an I/O error.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;

use crate::config::ChannelConfig;
use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

const FRAME_LEN_PREFIX_SIZE: usize = 4;

/// Length-prefixed framing over a reader/writer pair.
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    max_frame_len: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, max_frame_len: usize) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_len,
        }
    }
}

impl<S> StreamTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits a bidirectional stream into a transport.
    pub fn from_stream(stream: S, max_frame_len: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, max_frame_len)
    }

    /// Splits a bidirectional stream, taking the frame limit from `config`.
    pub fn from_config(stream: S, config: &ChannelConfig) -> Self {
        Self::from_stream(stream, config.max_frame_len)
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;

        // Only an EOF before the first prefix byte ends the stream cleanly.
        let mut prefix = [0u8; FRAME_LEN_PREFIX_SIZE];
        if reader.read(&mut prefix[..1]).await? == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut prefix[1..]).await?;

        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(TransportError::PayloadTooLarge { len, max: self.max_frame_len });
        }

        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    async fn close(&self) -> transport::Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_byte_stream() {
        let (left, right) = tokio::io::duplex(64);
        let a = StreamTransport::from_stream(left, 1024);
        let b = StreamTransport::from_stream(right, 1024);

        // Larger than the duplex buffer, so the frame is split on the way.
        let big = vec![7u8; 200];
        let sender = tokio::spawn(async move {
            a.send(b"hello").await.unwrap();
            a.send(&big).await.unwrap();
            a.send(b"").await.unwrap();
            a.close().await.unwrap();
        });

        assert_eq!(b.recv().await.unwrap().unwrap(), b"hello");
        assert_eq!(b.recv().await.unwrap().unwrap(), vec![7u8; 200]);
        assert_eq!(b.recv().await.unwrap().unwrap(), b"");
        assert!(b.recv().await.unwrap().is_none());
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frames_are_refused_both_ways() {
        let (left, right) = tokio::io::duplex(1024);
        let small = StreamTransport::from_stream(left, 8);
        let large = StreamTransport::from_stream(right, 1024);

        let err = small.send(&[0u8; 9]).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { len: 9, max: 8 }));

        large.send(&[0u8; 16]).await.unwrap();
        let err = small.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { len: 16, max: 8 }));
    }

    #[tokio::test]
    async fn test_frame_limit_comes_from_config() {
        let (left, right) = tokio::io::duplex(1024);
        let config = ChannelConfig::default().max_frame_len(4);
        let a = StreamTransport::from_config(left, &config);
        let b = StreamTransport::from_config(right, &ChannelConfig::default());

        let err = a.send(b"too long").await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { len: 8, max: 4 }));

        b.send(b"too long").await.unwrap();
        assert!(matches!(a.recv().await, Err(TransportError::PayloadTooLarge { len: 8, max: 4 })));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let (mut raw, right) = tokio::io::duplex(64);
        let b = StreamTransport::from_stream(right, 1024);

        raw.write_all(&10u32.to_le_bytes()).await.unwrap();
        raw.write_all(b"abc").await.unwrap();
        drop(raw);

        assert!(matches!(b.recv().await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_an_io_error() {
        let (mut raw, right) = tokio::io::duplex(64);
        let b = StreamTransport::from_stream(right, 1024);

        raw.write_all(&[5u8, 0]).await.unwrap();
        drop(raw);

        assert!(matches!(b.recv().await, Err(TransportError::Io(_))));
    }
}
