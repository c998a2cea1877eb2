//! The push engine: producers, gating and the sender thread.
//!
//! Three thread groups cooperate here. Capture/encoder callbacks produce
//! frames, one dedicated sender thread drains the queue into the publisher
//! session, and the owner thread starts/stops the engine and consumes
//! events. Media is gated until metadata is initialized on the session:
//! the video callback tracks SPS/PPS, the audio capture callback supplies
//! the audio parameters, and whichever side completes the picture last
//! performs `init_metadata` and wakes the sender.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use livepush_codec::flv::TagStream;
use livepush_codec::nal::ParameterSets;
use livepush_encoder::{AacEncoder, PcmFrame, SampleFormat};
use livepush_transport::{
    AudioCodec, AvFrame, FrameKind, MediaInfo, PublishSession, TransportResult, VideoCodec,
};

use crate::queue::FrameQueue;
use crate::{event_channel, EngineError, EngineResult, PushConfig, PushEvent};

/// Sentinel for "video timestamp base not yet anchored".
const VIDEO_BASE_UNSET: u64 = u64::MAX;

/// Condvar timeout while the sender waits for metadata.
const METADATA_WAIT: Duration = Duration::from_millis(50);

struct MediaState {
    info: MediaInfo,
    params: ParameterSets,
}

/// The capture-to-RTMP push engine.
///
/// Create with [`PushEngine::new`], hand the returned `Arc` to the capture
/// and encoder layers, and feed their output through
/// [`on_video_encoded`](Self::on_video_encoded) /
/// [`on_audio_pcm`](Self::on_audio_pcm). [`stop`](Self::stop) must run on
/// a thread other than the sender; a [`PushEvent::SendFailed`] event is the
/// sender asking the owner to do exactly that.
pub struct PushEngine {
    config: PushConfig,
    session: PublishSession,
    queue: Arc<FrameQueue>,
    aac: Mutex<AacEncoder>,
    media: Mutex<MediaState>,
    pushing: Arc<AtomicBool>,
    metadata_inited: Arc<AtomicBool>,
    have_audio_params: AtomicBool,
    video_base_us: AtomicU64,
    started_at: Mutex<Instant>,
    sender: Mutex<Option<JoinHandle<()>>>,
    event_tx: crossbeam_channel::Sender<PushEvent>,
}

impl PushEngine {
    /// Create an engine and the event stream its owner should consume.
    pub fn new(config: PushConfig) -> (Arc<Self>, Receiver<PushEvent>) {
        let (event_tx, event_rx) = event_channel();
        let aac = AacEncoder::new(config.audio_bitrate_kbps);
        let engine = Arc::new(Self {
            config,
            session: PublishSession::new(),
            queue: Arc::new(FrameQueue::new()),
            aac: Mutex::new(aac),
            media: Mutex::new(MediaState {
                info: MediaInfo::default(),
                params: ParameterSets::default(),
            }),
            pushing: Arc::new(AtomicBool::new(false)),
            metadata_inited: Arc::new(AtomicBool::new(false)),
            have_audio_params: AtomicBool::new(false),
            video_base_us: AtomicU64::new(VIDEO_BASE_UNSET),
            started_at: Mutex::new(Instant::now()),
            sender: Mutex::new(None),
            event_tx,
        });
        (engine, event_rx)
    }

    /// The publisher session (state callbacks are owned by the engine).
    pub fn session(&self) -> &PublishSession {
        &self.session
    }

    /// Connect to the configured URL and start the sender thread.
    #[instrument(name = "push_start", skip_all)]
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        let url = self.config.url.clone();
        self.start_with(move |session| session.connect(&url))
    }

    /// Start publishing into an arbitrary tag stream (FLV file output,
    /// tests) instead of connecting out.
    pub fn start_with_stream(
        self: &Arc<Self>,
        stream: Box<dyn TagStream + Send>,
    ) -> EngineResult<()> {
        self.start_with(move |session| {
            session.connect_stream(stream);
            Ok(())
        })
    }

    fn start_with(
        self: &Arc<Self>,
        connect: impl FnOnce(&PublishSession) -> TransportResult<()>,
    ) -> EngineResult<()> {
        if self.pushing.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        info!("starting push");

        // Fresh run state.
        self.metadata_inited.store(false, Ordering::SeqCst);
        self.have_audio_params.store(false, Ordering::SeqCst);
        self.video_base_us.store(VIDEO_BASE_UNSET, Ordering::SeqCst);
        *self.started_at.lock() = Instant::now();
        self.queue.reset();
        {
            let mut media = self.media.lock();
            media.params = ParameterSets::default();
            media.info = MediaInfo {
                video_codec: VideoCodec::H264,
                video_fps: self.config.video_fps,
                audio_codec: AudioCodec::Aac,
                ..MediaInfo::default()
            };
        }

        // Relay session state transitions to the owner.
        let events = self.event_tx.clone();
        self.session.set_callback(Box::new(move |state| {
            if events.try_send(PushEvent::StateChanged(state)).is_err() {
                warn!(?state, "event channel full, state change dropped");
            }
        }));

        // Encoded audio goes straight to the queue, gated on metadata.
        {
            let queue = Arc::clone(&self.queue);
            let pushing = Arc::clone(&self.pushing);
            let inited = Arc::clone(&self.metadata_inited);
            let mut aac = self.aac.lock();
            *aac = AacEncoder::new(self.config.audio_bitrate_kbps);
            aac.register_callback(Box::new(move |data, _pts_ms, pts_us| {
                if !pushing.load(Ordering::SeqCst) || !inited.load(Ordering::SeqCst) {
                    return;
                }
                queue.push(AvFrame::from_pts_us(
                    FrameKind::Audio,
                    pts_us,
                    Bytes::copy_from_slice(data),
                ));
            }));
        }

        if let Err(e) = connect(&self.session) {
            error!("connect failed: {e}");
            self.pushing.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("livepush-sender".into())
            .spawn(move || sender_loop(weak))
            .map_err(EngineError::Spawn)?;
        *self.sender.lock() = Some(handle);

        Ok(())
    }

    /// Stop publishing: signal the sender, join it, release the session.
    ///
    /// Must not be called from the sender thread.
    #[instrument(name = "push_stop", skip_all)]
    pub fn stop(&self) {
        if !self.pushing.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping push");

        self.queue.shutdown();
        if let Some(handle) = self.sender.lock().take() {
            let _ = handle.join();
        }
        self.queue.reset();
        self.session.release();

        self.metadata_inited.store(false, Ordering::SeqCst);
        self.have_audio_params.store(false, Ordering::SeqCst);
        self.video_base_us.store(VIDEO_BASE_UNSET, Ordering::SeqCst);
        info!("push stopped");
    }

    /// Whether the engine is currently pushing.
    pub fn is_pushing(&self) -> bool {
        self.pushing.load(Ordering::SeqCst)
    }

    /// Video encoder callback: one encoded Annex B access unit.
    pub fn on_video_encoded(&self, data: &[u8]) {
        if !self.pushing.load(Ordering::SeqCst) || data.is_empty() {
            return;
        }

        let scan = {
            let mut media = self.media.lock();
            let scan = media.params.scan(data);
            if scan.updated {
                let media = &mut *media;
                media.info.sps = media.params.sps().cloned().unwrap_or_default();
                media.info.pps = media.params.pps().cloned().unwrap_or_default();
            }
            scan
        };

        // A new or changed parameter set re-initializes metadata once the
        // audio side is known, so the sequence headers go out (again)
        // before the next media tag.
        if scan.updated && self.have_audio_params.load(Ordering::SeqCst) {
            self.try_init_metadata();
        }

        if !self.metadata_inited.load(Ordering::SeqCst) {
            trace!("video frame dropped, metadata not initialized");
            return;
        }

        // Video timestamps come from the monotonic clock, anchored at the
        // first frame accepted after metadata init so the publishing
        // timeline starts at 0 even after encoder warm-up.
        let now_us = self.started_at.lock().elapsed().as_micros() as u64;
        let base = match self.video_base_us.compare_exchange(
            VIDEO_BASE_UNSET,
            now_us,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => now_us,
            Err(existing) => existing,
        };
        let pts_us = now_us.saturating_sub(base);

        self.queue.push(AvFrame::from_pts_us(
            FrameKind::Video {
                keyframe: scan.has_idr,
            },
            pts_us,
            Bytes::copy_from_slice(data),
        ));
    }

    /// Audio capture callback: one chunk of PCM.
    ///
    /// The first chunk fixes the advertised audio parameters. PCM is only
    /// forwarded into the AAC encoder once metadata is initialized, so the
    /// sample-counted audio timeline cannot run ahead of the video
    /// timeline over dropped packets.
    pub fn on_audio_pcm(&self, frame: &PcmFrame) {
        if !self.pushing.load(Ordering::SeqCst) {
            return;
        }

        if !self.have_audio_params.swap(true, Ordering::SeqCst) {
            {
                let mut media = self.media.lock();
                media.info.audio_sample_rate = frame.sample_rate;
                media.info.audio_channels = frame.channels;
                media.info.audio_bits_per_sample = match frame.format {
                    SampleFormat::S16 => 16,
                    SampleFormat::F32 => 32,
                };
            }
            debug!(
                sample_rate = frame.sample_rate,
                channels = frame.channels,
                "audio parameters locked"
            );
            // Video may already be waiting on us.
            if !self.metadata_inited.load(Ordering::SeqCst) {
                self.try_init_metadata();
            }
        }

        if self.metadata_inited.load(Ordering::SeqCst) {
            if let Err(e) = self.aac.lock().push_pcm(frame) {
                warn!("audio encode failed: {e}");
            }
        } else {
            trace!("PCM dropped, metadata not initialized");
        }
    }

    /// Initialize session metadata if both sides are known; wakes the
    /// sender on success.
    fn try_init_metadata(&self) {
        let snapshot = self.media.lock().info.clone();
        if !snapshot.has_video_config() || snapshot.audio_sample_rate == 0 {
            return;
        }
        self.session.init_metadata(&snapshot, self.config.buffer_kb);
        self.metadata_inited.store(true, Ordering::SeqCst);
        self.queue.notify_all();
        debug!("metadata initialized");
    }
}

impl Drop for PushEngine {
    fn drop(&mut self) {
        // Signal only; joining here could deadlock if the final strong
        // reference is released on the sender thread itself.
        self.pushing.store(false, Ordering::SeqCst);
        self.queue.shutdown();
    }
}

/// The sender thread: drains the queue into the session.
///
/// Holds only a weak engine reference and exits as soon as the engine is
/// gone or the active flag clears.
fn sender_loop(weak: Weak<PushEngine>) {
    debug!("sender thread started");
    loop {
        let Some(engine) = weak.upgrade() else { break };
        if !engine.pushing.load(Ordering::SeqCst) {
            break;
        }

        if !engine.metadata_inited.load(Ordering::SeqCst) {
            engine.queue.wait_wakeup(METADATA_WAIT);
            continue;
        }

        let Some(frame) = engine.queue.pop_wait() else { break };
        if !engine.session.is_connected() {
            trace!("no connection, discarding frame");
            continue;
        }

        if engine.session.send_packet(&frame) == 0 {
            error!("send failed, asking owner to stop");
            if engine.event_tx.try_send(PushEvent::SendFailed).is_err() {
                warn!("event channel full, send failure not delivered");
            }
            break;
        }
    }
    debug!("sender thread exiting");
}
