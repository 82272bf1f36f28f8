//! Structured field encoding for packet bodies.
//!
//! All fields are fixed-width little-endian:
//!
//! | Type      | Encoding                          |
//! |-----------|-----------------------------------|
//! | `i32`     | 4 bytes LE                        |
//! | `f32/f64` | IEEE-754, LE                      |
//! | `bool`    | 1 byte, non-zero is true          |
//! | string    | `u32` byte length + UTF-8         |
//! | bytes     | `u32` length + raw bytes          |
//! | list      | `u32` count + elements            |
//!
//! # Example
//!
//! ```
//! use debug_wire::protocol::{StreamReader, StreamWriter};
//!
//! let mut writer = StreamWriter::new();
//! writer.write_string("hello").write_i32(-7);
//!
//! let mut reader = StreamReader::new(writer.finish());
//! assert_eq!(reader.read_string().unwrap(), "hello");
//! assert_eq!(reader.read_i32().unwrap(), -7);
//! assert!(reader.at_end());
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DebugWireError, Result};

/// Append-only encoder for structured fields.
#[derive(Debug, Default)]
pub struct StreamWriter {
    buf: BytesMut,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(value as u8);
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32_le(value);
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64_le(value);
        self
    }

    /// Write a length-prefixed byte blob.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.write_len(value.len());
        self.buf.extend_from_slice(value);
        self
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_string_list<S: AsRef<str>>(&mut self, values: &[S]) -> &mut Self {
        self.write_len(values.len());
        for value in values {
            self.write_string(value.as_ref());
        }
        self
    }

    pub fn write_f32_list(&mut self, values: &[f32]) -> &mut Self {
        self.write_len(values.len());
        for value in values {
            self.write_f32(*value);
        }
        self
    }

    fn write_len(&mut self, len: usize) {
        // Bodies are capped well below 4 GB by the packet layer.
        self.buf.put_u32_le(len as u32);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer and return the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor-style decoder over a packet body.
///
/// Every read checks the remaining length first, so truncated input yields a
/// [`DebugWireError::Decode`] instead of a panic.
#[derive(Debug, Clone)]
pub struct StreamReader {
    buf: Bytes,
}

impl StreamReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Whether all bytes have been consumed.
    pub fn at_end(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(DebugWireError::Decode(format!(
                "need {} bytes for {}, {} left",
                len,
                what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.need(1, "bool")?;
        Ok(self.buf.get_u8() != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.need(4, "f32")?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64_le())
    }

    /// Read a length-prefixed byte blob (zero-copy).
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.need(len, "byte array")?;
        Ok(self.buf.split_to(len))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DebugWireError::Decode(format!("invalid UTF-8 in string: {}", e)))
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let count = self.read_count(4)?;
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_f32_list(&mut self) -> Result<Vec<f32>> {
        let count = self.read_count(4)?;
        (0..count).map(|_| self.read_f32()).collect()
    }

    /// Read a list count, rejecting counts that cannot possibly fit in the
    /// remaining bytes given the smallest element size.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_size) > self.buf.remaining() {
            return Err(DebugWireError::Decode(format!(
                "list of {} elements cannot fit in {} bytes",
                count,
                self.buf.remaining()
            )));
        }
        Ok(count)
    }
}
