//! Bitstream-level building blocks for FLV-over-RTMP publishing.
//!
//! Everything in this crate is allocation-light and synchronous: AMF0
//! encoding for the `onMetaData` script tag, FLV tag framing, Annex B
//! NAL handling for H.264, and the small pieces of AAC framing (ADTS,
//! AudioSpecificConfig) a publisher needs.

pub mod aac;
pub mod amf0;
mod error;
pub mod flv;
pub mod nal;
pub mod sps;

pub use error::CodecError;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
