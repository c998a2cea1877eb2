//! FLV tag framing.
//!
//! A tag is an 11-byte header, the payload, and a 4-byte previous-tag-size:
//!
//! ```text
//! TagType(1) DataSize(3) Timestamp(3) TimestampExt(1) StreamID(3 = 0)
//! <payload>
//! PreviousTagSize(4) = 11 + payload length
//! ```
//!
//! Timestamps are 32-bit milliseconds split into a 24-bit low part and an
//! 8-bit extension (`ts >> 24`). The complete tag must reach the underlying
//! stream in a single `write` call: the consumer on the other side keeps a
//! stateful tag parser that cannot resynchronize across a fragmented tag,
//! so a short write is a hard failure.

use bytes::{BufMut, BytesMut};

use crate::{CodecError, CodecResult};

/// FLV tag header length.
pub const TAG_HEADER_LEN: usize = 11;

/// Trailing previous-tag-size field length.
pub const PREV_TAG_SIZE_LEN: usize = 4;

/// FLV tag type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagType {
    Audio = 0x08,
    Video = 0x09,
    Script = 0x12,
}

impl TagType {
    /// Map a raw tag type byte back to the enum.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(TagType::Audio),
            0x09 => Some(TagType::Video),
            0x12 => Some(TagType::Script),
            _ => None,
        }
    }
}

/// Byte sink for complete FLV tags.
///
/// `write` receives exactly one whole tag per call and returns the number
/// of bytes it accepted. Implementations must either take the full tag or
/// fail; [`write_tag`] treats any other count as [`CodecError::WriteShort`].
pub trait TagStream {
    fn write(&mut self, tag: &[u8]) -> std::io::Result<usize>;
}

/// Encode a complete FLV tag (header + payload + previous-tag-size).
pub fn encode_tag(tag_type: TagType, timestamp_ms: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(TAG_HEADER_LEN + payload.len() + PREV_TAG_SIZE_LEN);

    buf.put_u8(tag_type as u8);
    buf.put_u8(((payload.len() >> 16) & 0xFF) as u8);
    buf.put_u8(((payload.len() >> 8) & 0xFF) as u8);
    buf.put_u8((payload.len() & 0xFF) as u8);
    buf.put_u8(((timestamp_ms >> 16) & 0xFF) as u8);
    buf.put_u8(((timestamp_ms >> 8) & 0xFF) as u8);
    buf.put_u8((timestamp_ms & 0xFF) as u8);
    buf.put_u8(((timestamp_ms >> 24) & 0xFF) as u8);
    // StreamID, always 0
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(0);

    buf.put_slice(payload);
    buf.put_u32((TAG_HEADER_LEN + payload.len()) as u32);

    buf
}

/// Write one complete FLV tag to `stream` in a single call.
pub fn write_tag<S: TagStream + ?Sized>(
    stream: &mut S,
    tag_type: TagType,
    timestamp_ms: u32,
    payload: &[u8],
) -> CodecResult<()> {
    let tag = encode_tag(tag_type, timestamp_ms, payload);
    let written = stream.write(&tag)?;
    if written != tag.len() {
        return Err(CodecError::WriteShort {
            expected: tag.len(),
            written,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecStream(Vec<u8>);

    impl TagStream for VecStream {
        fn write(&mut self, tag: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(tag);
            Ok(tag.len())
        }
    }

    struct ShortStream;

    impl TagStream for ShortStream {
        fn write(&mut self, tag: &[u8]) -> std::io::Result<usize> {
            Ok(tag.len() - 1)
        }
    }

    #[test]
    fn tag_layout() {
        let tag = encode_tag(TagType::Video, 0x0102_0304, &[0xAA, 0xBB, 0xCC]);

        assert_eq!(tag[0], 0x09);
        // 24-bit payload size
        assert_eq!(&tag[1..4], &[0x00, 0x00, 0x03]);
        // 24-bit timestamp low + 8-bit extension
        assert_eq!(&tag[4..7], &[0x02, 0x03, 0x04]);
        assert_eq!(tag[7], 0x01);
        // stream id
        assert_eq!(&tag[8..11], &[0x00, 0x00, 0x00]);
        assert_eq!(&tag[11..14], &[0xAA, 0xBB, 0xCC]);
        // previous tag size = 11 + 3
        assert_eq!(&tag[14..18], &[0x00, 0x00, 0x00, 0x0E]);
    }

    #[test]
    fn writes_whole_tag_once() {
        let mut stream = VecStream(Vec::new());
        write_tag(&mut stream, TagType::Audio, 40, &[0xAF, 0x01, 0x21]).unwrap();
        assert_eq!(stream.0.len(), TAG_HEADER_LEN + 3 + PREV_TAG_SIZE_LEN);
        assert_eq!(stream.0[0], 0x08);
    }

    #[test]
    fn short_write_is_an_error() {
        let mut stream = ShortStream;
        let err = write_tag(&mut stream, TagType::Video, 0, &[0x00]).unwrap_err();
        assert!(matches!(err, CodecError::WriteShort { expected: 16, written: 15 }));
    }
}
