//! AAC audio encoding.
//!
//! This crate turns arbitrary capture PCM (S16 or F32 interleaved, any
//! sample rate and channel count) into raw AAC access units with
//! sample-accurate timestamps, ready for FLV muxing.

mod aac;
mod convert;
mod error;

pub use aac::AacEncoder;
pub use convert::PcmConverter;
pub use error::EncoderError;

use bytes::Bytes;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// PCM sample format of a capture frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit interleaved.
    S16,
    /// 32-bit float interleaved.
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    pub fn sample_bytes(self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// A frame of captured PCM audio.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Sample format of `data`.
    pub format: SampleFormat,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Number of interleaved channels.
    pub channels: u32,

    /// Interleaved sample data.
    pub data: Bytes,
}

impl PcmFrame {
    /// Number of per-channel sample frames in this chunk, or `None` when
    /// the byte length does not match the declared layout.
    pub fn frame_count(&self) -> Option<usize> {
        let frame_bytes = self.format.sample_bytes() * self.channels as usize;
        if frame_bytes == 0 || self.data.len() % frame_bytes != 0 {
            return None;
        }
        Some(self.data.len() / frame_bytes)
    }
}

/// Audio encoding configuration.
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Number of channels.
    pub channels: u32,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bitrate_kbps: 64,
        }
    }
}

/// Callback invoked for every encoded AAC access unit.
///
/// Arguments: raw AAC bytes, presentation timestamp in milliseconds, and
/// the same timestamp in microseconds.
pub type EncodedFrameCallback = Box<dyn FnMut(&[u8], u32, u64) + Send>;
