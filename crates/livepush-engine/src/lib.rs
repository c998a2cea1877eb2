//! The livepush send pipeline.
//!
//! Wires encoder callbacks to the RTMP publisher session: a bounded-latency
//! frame queue, a single sender thread per engine, and the start-up gating
//! that holds all media until both video parameter sets and audio
//! parameters are known.

mod error;
mod pipeline;
mod queue;

pub use error::EngineError;
pub use pipeline::PushEngine;
pub use queue::FrameQueue;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use livepush_transport::PublishState;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Channel capacity for events (engine -> owner).
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Push configuration supplied by the embedder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// RTMP publish URL (`rtmp://host[:port]/app/stream`).
    pub url: String,

    /// Advertised video frame rate.
    pub video_fps: u32,

    /// AAC target bitrate in kbps.
    pub audio_bitrate_kbps: u32,

    /// Advisory transport buffer size in KiB; currently unused by the
    /// session.
    pub buffer_kb: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            video_fps: 30,
            audio_bitrate_kbps: 64,
            buffer_kb: 1024,
        }
    }
}

/// Events the engine reports to its owner.
///
/// `SendFailed` asks the owner to run [`PushEngine::stop`] on its own
/// thread; the sender thread cannot tear the pipeline down itself without
/// joining itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushEvent {
    /// Relayed session state transition.
    StateChanged(PublishState),

    /// A tag write failed and the sender thread has exited.
    SendFailed,
}

/// Creates the bounded event channel used by [`PushEngine::new`].
pub(crate) fn event_channel() -> (Sender<PushEvent>, Receiver<PushEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
