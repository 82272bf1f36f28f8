//! Packet channel over an async byte stream.
//!
//! [`PacketChannel`] pairs a duplex stream with a [`PacketBuffer`]:
//! - `send` frames a body and writes it to the stream
//! - `pump` performs one read and feeds the bytes to the reassembly buffer
//! - `read` pops the oldest complete packet without blocking
//! - `wait_for_ready` pumps until a packet is available or a timeout elapses
//!
//! # Example
//!
//! ```ignore
//! use debug_wire::transport::PacketChannel;
//!
//! let mut channel = PacketChannel::new(stream);
//! channel.send(b"hello").await?;
//! if channel.wait_for_ready(Duration::from_secs(1)).await? {
//!     let packet = channel.read().unwrap();
//! }
//! ```

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{DebugWireError, Result};
use crate::protocol::{encode_packet, PacketBuffer, DEFAULT_MAX_PACKET_SIZE};

/// Read buffer size for a single `pump`.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Length-prefixed packet I/O over a stream.
pub struct PacketChannel<S> {
    stream: S,
    buffer: PacketBuffer,
    read_buf: Vec<u8>,
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with the default packet size limit.
    pub fn new(stream: S) -> Self {
        Self::with_max_packet_size(stream, DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(stream: S, max_packet_size: u32) -> Self {
        Self {
            stream,
            buffer: PacketBuffer::with_max_packet_size(max_packet_size),
            read_buf: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Frame `body` and write it to the stream.
    ///
    /// Empty bodies are not sent. A body too long for the length prefix fails
    /// the channel.
    pub async fn send(&mut self, body: &[u8]) -> Result<()> {
        if self.buffer.is_failed() {
            return Err(DebugWireError::ConnectionClosed);
        }

        let packet = match encode_packet(body) {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(()),
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };

        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read once from the stream and reassemble packets.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the
    /// stream. Cancel-safe: the only await point is the read itself.
    ///
    /// # Errors
    ///
    /// I/O errors, and a protocol error once when a framing violation is
    /// detected. A failed channel reports `Ok(0)` afterwards.
    pub async fn pump(&mut self) -> Result<usize> {
        if self.buffer.is_failed() {
            return Ok(0);
        }

        let n = self.stream.read(&mut self.read_buf).await?;
        if n == 0 {
            return Ok(0);
        }

        self.buffer.push(&self.read_buf[..n])?;
        Ok(n)
    }

    /// Pop the oldest complete packet, if any.
    pub fn read(&mut self) -> Option<Bytes> {
        self.buffer.read()
    }

    /// Wait until a packet is available, the stream closes, or `timeout`
    /// elapses. Returns whether a packet is ready.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.buffer.ready_len() > 0 {
                return Ok(true);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }

            match tokio::time::timeout(remaining, self.pump()).await {
                Ok(Ok(0)) => return Ok(self.buffer.ready_len() > 0),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Ok(false),
            }
        }
    }

    /// Stop reading packets for the rest of this channel's life. Packets
    /// already reassembled can still be read.
    pub fn fail(&mut self) {
        self.buffer.fail();
    }

    /// Whether the channel hit a framing violation.
    pub fn is_failed(&self) -> bool {
        self.buffer.is_failed()
    }

    /// Consume the channel and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
