//! AMF0 encoder.
//!
//! Only the subset a publisher needs to build an `onMetaData` script tag:
//! strings, numbers, booleans and an ECMA array of named numbers. Values
//! are encoded into a caller-supplied buffer; nothing is allocated here,
//! and running out of room fails with [`CodecError::InsufficientBuffer`]
//! so the caller can size its scratch buffer deliberately.
//!
//! Type markers (AMF0 File Format Specification):
//! ```text
//! 0x00 - Number (IEEE 754 double, big-endian)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x08 - ECMA Array (u32 count, then key/value pairs)
//! 0x09 - Object End (terminates an array as 0x00 0x00 0x09)
//! ```

use crate::{CodecError, CodecResult};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;

/// Cursor-style AMF0 writer over a fixed buffer.
pub struct Amf0Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Amf0Writer<'a> {
    /// Create a writer positioned at the start of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> CodecResult<()> {
        if self.pos + bytes.len() > self.buf.len() {
            return Err(CodecError::InsufficientBuffer);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Encode an AMF0 string (marker + u16 length + UTF-8 bytes).
    pub fn write_string(&mut self, value: &str) -> CodecResult<()> {
        if value.len() > u16::MAX as usize {
            return Err(CodecError::InsufficientBuffer);
        }
        self.put(&[MARKER_STRING])?;
        self.put(&(value.len() as u16).to_be_bytes())?;
        self.put(value.as_bytes())
    }

    /// Encode an AMF0 number (marker + IEEE-754 big-endian double).
    pub fn write_number(&mut self, value: f64) -> CodecResult<()> {
        self.put(&[MARKER_NUMBER])?;
        self.put(&value.to_be_bytes())
    }

    /// Encode an AMF0 boolean.
    pub fn write_boolean(&mut self, value: bool) -> CodecResult<()> {
        self.put(&[MARKER_BOOLEAN, value as u8])
    }

    /// Open an ECMA array and return the offset of its count field.
    ///
    /// The count is written as zero; pass the returned offset to
    /// [`end_ecma_array`](Self::end_ecma_array) once the real member count
    /// is known.
    pub fn begin_ecma_array(&mut self) -> CodecResult<usize> {
        self.put(&[MARKER_ECMA_ARRAY])?;
        let count_pos = self.pos;
        self.put(&0u32.to_be_bytes())?;
        Ok(count_pos)
    }

    /// Encode a named number array member (u16 key length + key + number).
    pub fn write_named_number(&mut self, key: &str, value: f64) -> CodecResult<()> {
        if key.len() > u16::MAX as usize {
            return Err(CodecError::InsufficientBuffer);
        }
        self.put(&(key.len() as u16).to_be_bytes())?;
        self.put(key.as_bytes())?;
        self.write_number(value)
    }

    /// Close an ECMA array: write the end marker and patch the count.
    pub fn end_ecma_array(&mut self, count_pos: usize, count: u32) -> CodecResult<()> {
        self.put(&[0x00, 0x00, MARKER_OBJECT_END])?;
        self.buf[count_pos..count_pos + 4].copy_from_slice(&count.to_be_bytes());
        Ok(())
    }
}
