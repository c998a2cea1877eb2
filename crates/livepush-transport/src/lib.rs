//! RTMP publishing transport.
//!
//! This crate owns the network half of the publisher: an RTMP client
//! connection (handshake, connect, createStream, publish) and the
//! [`PublishSession`] that muxes encoded frames into FLV tags with the
//! header sequencing and timestamp discipline ingest servers require.

mod error;
mod rtmp;
mod session;

pub use error::TransportError;
pub use rtmp::RtmpConnection;
pub use session::PublishSession;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Video codec carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    None,
    H264,
}

/// Audio codec carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioCodec {
    #[default]
    None,
    Aac,
}

/// Stream parameters advertised in `onMetaData` and the sequence headers.
///
/// Producers mutate this under a lock and hand the session a snapshot by
/// value; the session never reads it behind the caller's back.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub video_codec: VideoCodec,
    pub video_fps: u32,
    /// Most recent SPS NAL (no start code), empty when unknown.
    pub sps: Bytes,
    /// Most recent PPS NAL (no start code), empty when unknown.
    pub pps: Bytes,
    pub audio_codec: AudioCodec,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    pub audio_bits_per_sample: u32,
}

impl MediaInfo {
    /// Whether both video parameter sets are known.
    pub fn has_video_config(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }
}

/// Kind of an enqueued audio/video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video { keyframe: bool },
    Audio,
}

/// One encoded frame on its way to the wire.
///
/// The authoritative timestamp is the second/microsecond pair; `pts_ms`
/// is kept alongside for logging and queue inspection.
#[derive(Debug, Clone)]
pub struct AvFrame {
    pub kind: FrameKind,
    pub pts_ms: u32,
    pub pts_sec: u32,
    pub pts_usec: u32,
    /// Encoded payload: Annex B H.264 or raw/ADTS AAC.
    pub data: Bytes,
}

impl AvFrame {
    /// Build a frame from a microsecond timestamp.
    pub fn from_pts_us(kind: FrameKind, pts_us: u64, data: Bytes) -> Self {
        Self {
            kind,
            pts_ms: (pts_us / 1000) as u32,
            pts_sec: (pts_us / 1_000_000) as u32,
            pts_usec: (pts_us % 1_000_000) as u32,
            data,
        }
    }

    /// Wire timestamp in 32-bit milliseconds.
    pub fn timestamp_ms(&self) -> u32 {
        self.pts_sec
            .wrapping_mul(1000)
            .wrapping_add(self.pts_usec / 1000)
    }
}

/// Publishing state notifications delivered to the session callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishState {
    Connecting,
    Connected,
    ConnectFailed,
    ConnectAbort,
    Pushing,
    Error,
    Disconnected,
}

/// Session state-transition callback.
///
/// Invoked synchronously on whichever thread triggers the transition;
/// implementations must be non-blocking and must not re-enter the
/// session.
pub type StateCallback = Box<dyn Fn(PublishState) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_from_sec_usec_pair() {
        let frame = AvFrame {
            kind: FrameKind::Audio,
            pts_ms: 0,
            pts_sec: 3,
            pts_usec: 250_999,
            data: Bytes::new(),
        };
        assert_eq!(frame.timestamp_ms(), 3250);
    }

    #[test]
    fn frame_from_microseconds() {
        let frame = AvFrame::from_pts_us(
            FrameKind::Video { keyframe: true },
            1_250_000,
            Bytes::new(),
        );
        assert_eq!(frame.pts_sec, 1);
        assert_eq!(frame.pts_usec, 250_000);
        assert_eq!(frame.pts_ms, 1250);
        assert_eq!(frame.timestamp_ms(), 1250);
    }
}
