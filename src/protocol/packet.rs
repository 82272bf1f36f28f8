//! Length-prefixed packet framing.
//!
//! Every packet on the wire is a 4-byte little-endian length followed by the
//! packet body. The length counts itself, so the smallest legal value is 4:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ Total length     │ Body                      │
//! │ 4 bytes, u32 LE  │ total length - 4 bytes    │
//! └──────────────────┴───────────────────────────┘
//! ```
//!
//! [`PacketBuffer`] is the receiving half. It runs a two-state machine over
//! whatever bytes the transport hands it:
//! - `AwaitingHeader`: need 4 bytes to learn the packet length
//! - `AwaitingBody`: length known, need `length - 4` more bytes
//!
//! Completed packets are queued in arrival order and popped with
//! [`PacketBuffer::read`]. The first framing violation stops parsing for good;
//! packets completed before it stay readable.
//!
//! # Example
//!
//! ```
//! use debug_wire::protocol::{encode_packet, PacketBuffer};
//!
//! let wire = encode_packet(b"hello").unwrap().unwrap();
//!
//! let mut buffer = PacketBuffer::new();
//! assert_eq!(buffer.push(&wire).unwrap(), 1);
//! assert_eq!(&buffer.read().unwrap()[..], b"hello");
//! assert!(buffer.read().is_none());
//! ```

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DebugWireError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum accepted packet size (1 GB), length prefix included.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1_073_741_824;

/// Compute the on-wire length field for a body of `body_len` bytes.
///
/// Fails if the total does not fit in a `u32`.
pub fn packet_length(body_len: usize) -> Result<u32> {
    body_len
        .checked_add(LENGTH_PREFIX_SIZE)
        .and_then(|total| u32::try_from(total).ok())
        .ok_or_else(|| {
            DebugWireError::Protocol(format!(
                "Packet body of {} bytes exceeds the maximum packet length",
                body_len
            ))
        })
}

/// Encode a packet body into its wire form.
///
/// Returns `Ok(None)` for an empty body: empty packets are never sent.
pub fn encode_packet(body: &[u8]) -> Result<Option<Bytes>> {
    if body.is_empty() {
        return Ok(None);
    }

    let length = packet_length(body.len())?;
    let mut buf = BytesMut::with_capacity(length as usize);
    buf.put_u32_le(length);
    buf.extend_from_slice(body);
    Ok(Some(buf.freeze()))
}

/// State machine for packet parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 4-byte length prefix.
    AwaitingHeader,
    /// Length parsed, waiting for the rest of the body.
    AwaitingBody { remaining: usize },
}

/// Reassembly buffer for incoming packets.
///
/// Holds the partial packet in progress plus a FIFO of complete packets that
/// have not been read yet.
#[derive(Debug)]
pub struct PacketBuffer {
    /// Accumulated bytes not yet assigned to a complete packet.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Complete, undelivered packet bodies.
    ready: VecDeque<Bytes>,
    /// Largest accepted length prefix.
    max_packet_size: u32,
    /// Set once a framing violation is seen.
    failed: bool,
}

impl PacketBuffer {
    /// Create a new buffer with the default size limit.
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Create a new buffer rejecting packets larger than `max_packet_size`.
    pub fn with_max_packet_size(max_packet_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::AwaitingHeader,
            ready: VecDeque::new(),
            max_packet_size,
            failed: false,
        }
    }

    /// Feed bytes from the transport.
    ///
    /// Returns the number of packets completed by this call. A single call
    /// may complete several packets.
    ///
    /// # Errors
    ///
    /// Returns a protocol error the first time a framing violation is found.
    /// The buffer is failed from then on: later calls return `Ok(0)`.
    /// Packets completed before the violation, including earlier in the
    /// same call, remain readable.
    pub fn push(&mut self, data: &[u8]) -> Result<usize> {
        if self.failed {
            return Ok(0);
        }

        self.buffer.extend_from_slice(data);

        let mut completed = 0;
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        break;
                    }

                    let header = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);

                    if (length as usize) < LENGTH_PREFIX_SIZE {
                        self.fail();
                        return Err(DebugWireError::Protocol(format!(
                            "Packet length {} is smaller than the length prefix",
                            length
                        )));
                    }
                    if length > self.max_packet_size {
                        self.fail();
                        return Err(DebugWireError::Protocol(format!(
                            "Packet length {} exceeds maximum {}",
                            length, self.max_packet_size
                        )));
                    }

                    self.state = State::AwaitingBody {
                        remaining: length as usize - LENGTH_PREFIX_SIZE,
                    };
                }

                State::AwaitingBody { remaining } => {
                    if self.buffer.len() < remaining {
                        break;
                    }

                    let body = self.buffer.split_to(remaining).freeze();
                    self.state = State::AwaitingHeader;

                    // A zero-length body is legal framing but carries nothing.
                    if !body.is_empty() {
                        self.ready.push_back(body);
                        completed += 1;
                    }
                }
            }
        }

        Ok(completed)
    }

    /// Pop the oldest complete packet, if any. Never blocks.
    pub fn read(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }

    /// Number of complete packets waiting to be read.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Permanently stop parsing.
    ///
    /// Drops the partial packet in progress. Packets completed before the
    /// failure stay readable, so what is delivered does not depend on how
    /// the stream was split into reads.
    pub fn fail(&mut self) {
        self.failed = true;
        self.buffer.clear();
        self.state = State::AwaitingHeader;
    }

    /// Whether a framing violation has disabled this buffer.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Number of bytes buffered towards the next packet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::AwaitingHeader => "AwaitingHeader",
            State::AwaitingBody { .. } => "AwaitingBody",
        }
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(body: &[u8]) -> Vec<u8> {
        encode_packet(body).unwrap().unwrap().to_vec()
    }

    fn drain(buffer: &mut PacketBuffer) -> Vec<Bytes> {
        std::iter::from_fn(|| buffer.read()).collect()
    }

    #[test]
    fn test_length_includes_prefix() {
        let bytes = wire(b"abc");
        assert_eq!(bytes.len(), 7);
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..], b"abc");
    }

    #[test]
    fn test_empty_body_is_not_encoded() {
        assert!(encode_packet(b"").unwrap().is_none());
    }

    #[test]
    fn test_packet_length_overflow() {
        let err = packet_length(usize::MAX).unwrap_err();
        assert!(matches!(err, DebugWireError::Protocol(_)));

        let limit = u32::MAX as usize - LENGTH_PREFIX_SIZE;
        assert_eq!(packet_length(limit).unwrap(), u32::MAX);
        assert!(packet_length(limit + 1).is_err());
    }

    #[test]
    fn test_single_packet() {
        let mut buffer = PacketBuffer::new();

        assert_eq!(buffer.push(&wire(b"hello")).unwrap(), 1);
        assert_eq!(&buffer.read().unwrap()[..], b"hello");
        assert!(buffer.read().is_none());
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn test_multiple_packets_in_one_push() {
        let mut buffer = PacketBuffer::new();
        let mut combined = wire(b"first");
        combined.extend(wire(b"second"));
        combined.extend(wire(b"third"));

        assert_eq!(buffer.push(&combined).unwrap(), 3);
        let packets = drain(&mut buffer);
        assert_eq!(packets, vec![&b"first"[..], &b"second"[..], &b"third"[..]]);
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = PacketBuffer::new();
        let bytes = wire(b"test");

        assert_eq!(buffer.push(&bytes[..2]).unwrap(), 0);
        assert_eq!(buffer.state_name(), "AwaitingHeader");

        assert_eq!(buffer.push(&bytes[2..]).unwrap(), 1);
        assert_eq!(&buffer.read().unwrap()[..], b"test");
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = PacketBuffer::new();
        let body = b"this is a longer body that will arrive in pieces";
        let bytes = wire(body);

        assert_eq!(buffer.push(&bytes[..LENGTH_PREFIX_SIZE + 10]).unwrap(), 0);
        assert_eq!(buffer.state_name(), "AwaitingBody");

        assert_eq!(buffer.push(&bytes[LENGTH_PREFIX_SIZE + 10..]).unwrap(), 1);
        assert_eq!(&buffer.read().unwrap()[..], body);
    }

    #[test]
    fn test_split_at_every_boundary_matches_whole() {
        let mut stream = Vec::new();
        for body in [&b"a"[..], b"bc", b"def", &[0u8; 300][..]] {
            stream.extend(wire(body));
        }

        let mut whole = PacketBuffer::new();
        whole.push(&stream).unwrap();
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), 4);

        for split in 0..=stream.len() {
            let mut buffer = PacketBuffer::new();
            buffer.push(&stream[..split]).unwrap();
            buffer.push(&stream[split..]).unwrap();
            assert_eq!(drain(&mut buffer), expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut stream = wire(b"hi");
        stream.extend(wire(b"there"));

        let mut buffer = PacketBuffer::new();
        for byte in &stream {
            buffer.push(&[*byte]).unwrap();
        }

        assert_eq!(drain(&mut buffer), vec![&b"hi"[..], &b"there"[..]]);
    }

    #[test]
    fn test_short_length_fails_permanently() {
        let mut buffer = PacketBuffer::new();
        let mut stream = 3u32.to_le_bytes().to_vec();
        stream.extend(wire(b"after"));

        let err = buffer.push(&stream).unwrap_err();
        assert!(err.to_string().contains("smaller than the length prefix"));
        assert!(buffer.is_failed());
        assert!(buffer.read().is_none());

        // Well-formed data after the violation is ignored.
        assert_eq!(buffer.push(&wire(b"later")).unwrap(), 0);
        assert!(buffer.read().is_none());
    }

    #[test]
    fn test_violation_keeps_completed_packets() {
        let mut stream = wire(b"good");
        stream.extend(2u32.to_le_bytes());
        stream.extend(wire(b"after"));

        let mut whole = PacketBuffer::new();
        assert!(whole.push(&stream).is_err());

        let boundary = LENGTH_PREFIX_SIZE + 4;
        let mut split = PacketBuffer::new();
        assert_eq!(split.push(&stream[..boundary]).unwrap(), 1);
        assert!(split.push(&stream[boundary..]).is_err());

        for buffer in [&mut whole, &mut split] {
            assert!(buffer.is_failed());
            assert_eq!(buffer.read().unwrap(), &b"good"[..]);
            assert!(buffer.read().is_none());
        }
    }

    #[test]
    fn test_max_packet_size() {
        let mut buffer = PacketBuffer::with_max_packet_size(100);

        let err = buffer.push(&1000u32.to_le_bytes()).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
        assert!(buffer.is_failed());
    }

    #[test]
    fn test_zero_body_frame_is_skipped() {
        let mut buffer = PacketBuffer::new();
        let mut stream = 4u32.to_le_bytes().to_vec();
        stream.extend(wire(b"next"));

        assert_eq!(buffer.push(&stream).unwrap(), 1);
        assert_eq!(&buffer.read().unwrap()[..], b"next");
    }
}
