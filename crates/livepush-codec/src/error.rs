//! Error types for the codec module.

use thiserror::Error;

/// Errors that can occur while encoding AMF0 values or FLV tags.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The caller-supplied buffer cannot hold the encoded value.
    #[error("buffer too small for AMF0 value")]
    InsufficientBuffer,

    /// The underlying stream accepted fewer bytes than the full tag.
    #[error("short FLV tag write: {written} of {expected} bytes")]
    WriteShort { expected: usize, written: usize },

    /// IO error from the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
