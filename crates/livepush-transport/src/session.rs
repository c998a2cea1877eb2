//! The RTMP publishing session.
//!
//! Owns the connection, the advertised [`MediaInfo`], the header-sequencing
//! flags and the global timestamp watermark. All tags of a session ride a
//! single RTMP chunk stream, so timestamps must be non-decreasing across
//! audio, video and script tags alike; `last_ts_ms` enforces that by
//! clamping any regressing timestamp up to the watermark.

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use livepush_codec::amf0::Amf0Writer;
use livepush_codec::flv::{self, TagStream, TagType};
use livepush_codec::{aac, nal, sps};

use crate::rtmp::RtmpConnection;
use crate::{
    AudioCodec, AvFrame, FrameKind, MediaInfo, PublishState, StateCallback, TransportError,
    TransportResult, VideoCodec,
};

/// Scratch buffer for the AMF0 `onMetaData` payload.
const METADATA_BUFFER_LEN: usize = 2048;

struct SessionInner {
    /// Publish URL; owned by the session so it stays stable for the whole
    /// connection lifetime.
    url: String,
    stream: Option<Box<dyn TagStream + Send>>,
    media_info: MediaInfo,
    metadata_set: bool,
    connected: bool,
    headers_sent: bool,
    /// AudioSpecificConfig sent in the AAC sequence header.
    aac_asc: Option<[u8; 2]>,
    /// Global monotonic watermark across every tag; `None` until the first
    /// tag is written.
    last_ts_ms: Option<u32>,
    callback: Option<StateCallback>,
}

impl SessionInner {
    fn notify(&self, state: PublishState) {
        debug!(?state, "publish state");
        if let Some(callback) = &self.callback {
            callback(state);
        }
    }
}

/// A single-publisher RTMP session.
///
/// Thread-safe: every mutating operation takes the session lock, and tag
/// writes happen under it so ordering and the timestamp watermark hold
/// even with racing callers. The sender thread is expected to be the only
/// hot-path caller of [`send_packet`](Self::send_packet).
pub struct PublishSession {
    inner: Mutex<SessionInner>,
}

impl PublishSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                url: String::new(),
                stream: None,
                media_info: MediaInfo::default(),
                metadata_set: false,
                connected: false,
                headers_sent: false,
                aac_asc: None,
                last_ts_ms: None,
                callback: None,
            }),
        }
    }

    /// Install the state-transition callback.
    ///
    /// Transitions are delivered synchronously on the thread that causes
    /// them; the callback must not block or re-enter the session.
    pub fn set_callback(&self, callback: StateCallback) {
        self.inner.lock().callback = Some(callback);
    }

    /// Copy `info` into the session and mark metadata as initialized.
    ///
    /// Also clears `headers_sent`, so updated parameter sets re-emit the
    /// sequence headers along with the next media tag. `buffer_kb` is
    /// advisory and currently ignored.
    pub fn init_metadata(&self, info: &MediaInfo, _buffer_kb: u32) {
        let mut inner = self.inner.lock();
        inner.media_info = info.clone();
        inner.metadata_set = true;
        inner.headers_sent = false;
        debug!(
            has_video = info.has_video_config(),
            audio_rate = info.audio_sample_rate,
            "metadata initialized"
        );
    }

    /// Connect to an RTMP server and complete the publish handshake.
    ///
    /// Blocking. Tears down any previous connection first. Notifies
    /// `Connecting`, then `Connected` or `ConnectFailed`.
    #[instrument(name = "session_connect", skip_all, fields(url = %url))]
    pub fn connect(&self, url: &str) -> TransportResult<()> {
        if url.is_empty() {
            return Err(TransportError::BadArgument("empty URL".into()));
        }

        let mut inner = self.inner.lock();
        inner.url = url.to_string();
        inner.stream = None;
        inner.connected = false;
        inner.headers_sent = false;

        inner.notify(PublishState::Connecting);
        match RtmpConnection::connect(&inner.url) {
            Ok(connection) => {
                inner.stream = Some(Box::new(connection));
                inner.connected = true;
                inner.notify(PublishState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("RTMP connect failed: {e}");
                inner.notify(PublishState::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Publish into an arbitrary tag stream instead of a network
    /// connection (FLV file output, tests).
    pub fn connect_stream(&self, stream: Box<dyn TagStream + Send>) {
        let mut inner = self.inner.lock();
        inner.stream = Some(stream);
        inner.connected = true;
        inner.headers_sent = false;
        inner.notify(PublishState::Connecting);
        inner.notify(PublishState::Connected);
    }

    /// Whether the session currently holds a usable connection.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Queue/buffer occupancy. The underlying transport exposes no real
    /// figure; kept for API parity and always `(0, 0)`.
    pub fn buffer_info(&self) -> (usize, usize) {
        (0, 0)
    }

    /// AudioSpecificConfig last sent in the AAC sequence header.
    pub fn audio_specific_config(&self) -> Option<[u8; 2]> {
        self.inner.lock().aac_asc
    }

    /// Mux one encoded frame into an FLV tag and write it.
    ///
    /// Returns the accepted payload length, or 0 when the frame is
    /// rejected (not connected, metadata not ready, empty conversion) or
    /// the write fails. A failed write notifies `Error`, closes the
    /// connection and leaves the session disconnected; no automatic
    /// reconnect is attempted.
    pub fn send_packet(&self, frame: &AvFrame) -> usize {
        if frame.data.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock();
        if inner.stream.is_none() || !inner.connected {
            return 0;
        }

        match send_headers_if_needed(&mut inner) {
            Ok(()) => {}
            Err(TransportError::IllegalState(_)) => return 0,
            Err(e) => {
                // Header emission failed mid-way; headers_sent stays false
                // so the next send retries the full sequence.
                warn!("header emission failed: {e}");
                return 0;
            }
        }

        // Clamp to the watermark: tags on the session's single RTMP chunk
        // stream must never go backwards in time.
        let mut ts = frame.timestamp_ms();
        if let Some(last) = inner.last_ts_ms {
            if ts < last {
                ts = last;
            }
        }
        inner.last_ts_ms = Some(ts);

        let (tag_type, payload) = match frame.kind {
            FrameKind::Video { keyframe } => {
                let avcc = nal::annex_b_to_avcc(&frame.data);
                if avcc.is_empty() {
                    return 0;
                }
                let mut payload = BytesMut::with_capacity(5 + avcc.len());
                payload.extend_from_slice(&[
                    if keyframe { 0x17 } else { 0x27 },
                    0x01, // AVC NALU
                    0x00,
                    0x00,
                    0x00, // composition time
                ]);
                payload.extend_from_slice(&avcc);
                (TagType::Video, payload)
            }
            FrameKind::Audio => {
                let raw = aac::strip_adts(&frame.data);
                if raw.is_empty() {
                    return 0;
                }
                let header = aac::flv_sound_header(
                    inner.media_info.audio_sample_rate,
                    inner.media_info.audio_channels,
                );
                let mut payload = BytesMut::with_capacity(2 + raw.len());
                payload.extend_from_slice(&[header, 0x01]); // AAC raw
                payload.extend_from_slice(raw);
                (TagType::Audio, payload)
            }
        };

        let inner = &mut *inner;
        let stream = match inner.stream.as_mut() {
            Some(stream) => stream,
            None => return 0,
        };
        if let Err(e) = flv::write_tag(stream.as_mut(), tag_type, ts, &payload) {
            error!(?tag_type, ts, "tag write failed: {e}");
            inner.notify(PublishState::Error);
            inner.stream = None;
            inner.connected = false;
            inner.headers_sent = false;
            return 0;
        }

        frame.data.len()
    }

    /// Close the connection and notify `Disconnected`.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.stream = None;
        inner.connected = false;
        inner.headers_sent = false;
        inner.notify(PublishState::Disconnected);
        info!("session released");
    }
}

impl Default for PublishSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit onMetaData and the sequence headers once per metadata generation.
///
/// Headers are stamped with the current watermark (0 before any tag) so
/// the handshake can never violate monotonicity. On the first write
/// failure the error surfaces to the caller with `headers_sent` still
/// false; a later send retries the whole sequence.
fn send_headers_if_needed(inner: &mut SessionInner) -> TransportResult<()> {
    if inner.headers_sent {
        return Ok(());
    }
    if !inner.metadata_set {
        return Err(TransportError::IllegalState("metadata not initialized"));
    }

    let hdr_ts = inner.last_ts_ms.unwrap_or(0);
    let info = inner.media_info.clone();
    let inner = &mut *inner;
    let stream = match inner.stream.as_mut() {
        Some(stream) => stream,
        None => return Err(TransportError::NotConnected),
    };

    // onMetaData script tag.
    let mut buf = [0u8; METADATA_BUFFER_LEN];
    let len = encode_metadata(&info, &mut buf)?;
    flv::write_tag(stream.as_mut(), TagType::Script, hdr_ts, &buf[..len])?;
    inner.last_ts_ms.get_or_insert(hdr_ts);

    // AVC sequence header, only with both parameter sets in hand.
    if info.has_video_config() {
        if let Some(config) = nal::avc_decoder_config(&info.sps, &info.pps) {
            let mut payload = BytesMut::with_capacity(5 + config.len());
            payload.extend_from_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]);
            payload.extend_from_slice(&config);
            flv::write_tag(stream.as_mut(), TagType::Video, hdr_ts, &payload)?;
        }
    }

    // AAC sequence header.
    if info.audio_codec == AudioCodec::Aac && info.audio_sample_rate > 0 {
        let asc = aac::audio_specific_config(info.audio_sample_rate, info.audio_channels);
        inner.aac_asc = Some(asc);
        let header = aac::flv_sound_header(info.audio_sample_rate, info.audio_channels);
        let payload = [header, 0x00, asc[0], asc[1]]; // AAC sequence header
        flv::write_tag(stream.as_mut(), TagType::Audio, hdr_ts, &payload)?;
    }

    inner.headers_sent = true;
    inner.notify(PublishState::Pushing);
    info!(hdr_ts, "stream headers sent");
    Ok(())
}

/// Encode the `onMetaData` payload, advertising only fields whose source
/// values are present. Returns the payload length.
fn encode_metadata(info: &MediaInfo, buf: &mut [u8]) -> TransportResult<usize> {
    let mut writer = Amf0Writer::new(buf);
    writer.write_string("onMetaData")?;
    let count_pos = writer.begin_ecma_array()?;
    let mut count = 0u32;

    let mut put = |writer: &mut Amf0Writer<'_>, key: &str, value: f64| -> TransportResult<()> {
        writer.write_named_number(key, value)?;
        count += 1;
        Ok(())
    };

    if info.has_video_config() {
        let (width, height) = sps::parse_resolution(&info.sps).unwrap_or((0, 0));
        put(&mut writer, "width", width as f64)?;
        put(&mut writer, "height", height as f64)?;
        put(&mut writer, "framerate", info.video_fps as f64)?;
        // FLV has no id for anything past AVC; omit rather than advertise
        // an unknown value.
        if info.video_codec == VideoCodec::H264 {
            put(&mut writer, "videocodecid", 7.0)?;
        }
    }

    if info.audio_codec == AudioCodec::Aac {
        put(&mut writer, "audiocodecid", 10.0)?;
        if info.audio_sample_rate > 0 {
            put(&mut writer, "audiosamplerate", info.audio_sample_rate as f64)?;
        }
        if info.audio_channels > 0 {
            put(&mut writer, "audiochannels", info.audio_channels as f64)?;
        }
        if info.audio_bits_per_sample > 0 {
            put(
                &mut writer,
                "audiosamplesize",
                info.audio_bits_per_sample as f64,
            )?;
        }
    }

    put(&mut writer, "videodatarate", 0.0)?;
    put(&mut writer, "audiodatarate", 0.0)?;

    writer.end_ecma_array(count_pos, count)?;
    Ok(writer.position())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;

    const SPS_A: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB];
    const SPS_B: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xCD];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    /// Captures whole tags; short-writes everything past `fail_after`.
    #[derive(Clone)]
    struct MockStream {
        tags: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_after: Option<usize>,
    }

    impl MockStream {
        fn new() -> Self {
            Self {
                tags: Arc::new(Mutex::new(Vec::new())),
                fail_after: None,
            }
        }

        fn failing_after(tags: usize) -> Self {
            Self {
                fail_after: Some(tags),
                ..Self::new()
            }
        }
    }

    impl TagStream for MockStream {
        fn write(&mut self, tag: &[u8]) -> std::io::Result<usize> {
            let mut tags = self.tags.lock();
            if self.fail_after.is_some_and(|n| tags.len() >= n) {
                return Ok(tag.len() - 1);
            }
            tags.push(tag.to_vec());
            Ok(tag.len())
        }
    }

    fn parse_tag(tag: &[u8]) -> (u8, u32, &[u8]) {
        let len = ((tag[1] as usize) << 16) | ((tag[2] as usize) << 8) | tag[3] as usize;
        let ts = ((tag[7] as u32) << 24)
            | ((tag[4] as u32) << 16)
            | ((tag[5] as u32) << 8)
            | tag[6] as u32;
        (tag[0], ts, &tag[11..11 + len])
    }

    fn full_media_info() -> MediaInfo {
        MediaInfo {
            video_codec: VideoCodec::H264,
            video_fps: 30,
            sps: Bytes::from_static(SPS_A),
            pps: Bytes::from_static(PPS),
            audio_codec: AudioCodec::Aac,
            audio_sample_rate: 48000,
            audio_channels: 2,
            audio_bits_per_sample: 16,
        }
    }

    fn annex_b_idr(sps: &[u8]) -> Bytes {
        let mut data = Vec::new();
        for nal in [sps, PPS, &[0x65, 0x88, 0x84, 0x21][..]] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nal);
        }
        Bytes::from(data)
    }

    fn video_frame(pts_ms: u64, sps: &[u8]) -> AvFrame {
        AvFrame::from_pts_us(FrameKind::Video { keyframe: true }, pts_ms * 1000, annex_b_idr(sps))
    }

    fn audio_frame(pts_ms: u64, data: &[u8]) -> AvFrame {
        AvFrame::from_pts_us(FrameKind::Audio, pts_ms * 1000, Bytes::copy_from_slice(data))
    }

    fn session_with(stream: MockStream) -> (PublishSession, Arc<Mutex<Vec<PublishState>>>) {
        let session = PublishSession::new();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        session.set_callback(Box::new(move |state| sink.lock().push(state)));
        session.connect_stream(Box::new(stream));
        (session, states)
    }

    #[test]
    fn headers_precede_media_in_order() {
        let stream = MockStream::new();
        let tags = Arc::clone(&stream.tags);
        let (session, states) = session_with(stream);

        session.init_metadata(&full_media_info(), 1024);
        let accepted = session.send_packet(&video_frame(0, SPS_A));
        assert!(accepted > 0);

        let tags = tags.lock();
        assert_eq!(tags.len(), 4);

        let (script, ts0, metadata) = parse_tag(&tags[0]);
        assert_eq!(script, 0x12);
        assert_eq!(ts0, 0);
        // AMF0 string "onMetaData", then an ECMA array of 10 members.
        assert_eq!(&metadata[..13], &[
            0x02, 0x00, 0x0A, b'o', b'n', b'M', b'e', b't', b'a', b'D', b'a', b't', b'a'
        ]);
        assert_eq!(metadata[13], 0x08);
        assert_eq!(&metadata[14..18], &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&metadata[metadata.len() - 3..], &[0x00, 0x00, 0x09]);

        let (video, _, avc_seq) = parse_tag(&tags[1]);
        assert_eq!(video, 0x09);
        assert_eq!(&avc_seq[..5], &[0x17, 0x00, 0x00, 0x00, 0x00]);
        // AVCDecoderConfigurationRecord carries the SPS profile bytes.
        assert_eq!(&avc_seq[5..9], &[0x01, SPS_A[1], SPS_A[2], SPS_A[3]]);

        let (audio, _, aac_seq) = parse_tag(&tags[2]);
        assert_eq!(audio, 0x08);
        assert_eq!(aac_seq, &[0xAF, 0x00, 0x11, 0x90]);
        assert_eq!(session.audio_specific_config(), Some([0x11, 0x90]));

        let (media, _, media_payload) = parse_tag(&tags[3]);
        assert_eq!(media, 0x09);
        assert_eq!(&media_payload[..5], &[0x17, 0x01, 0x00, 0x00, 0x00]);
        // AVCC: 4-byte length then the first NAL.
        assert_eq!(&media_payload[5..9], &(SPS_A.len() as u32).to_be_bytes());

        assert_eq!(
            states.lock().as_slice(),
            &[
                PublishState::Connecting,
                PublishState::Connected,
                PublishState::Pushing
            ]
        );
    }

    #[test]
    fn no_media_before_metadata() {
        let stream = MockStream::new();
        let tags = Arc::clone(&stream.tags);
        let (session, states) = session_with(stream);

        assert_eq!(session.send_packet(&audio_frame(0, &[0x21, 0x42])), 0);
        assert!(tags.lock().is_empty());
        assert!(!states.lock().contains(&PublishState::Pushing));
    }

    #[test]
    fn regressing_timestamps_are_clamped() {
        let stream = MockStream::new();
        let tags = Arc::clone(&stream.tags);
        let (session, _) = session_with(stream);

        session.init_metadata(&full_media_info(), 1024);
        assert!(session.send_packet(&video_frame(100, SPS_A)) > 0);
        assert!(session.send_packet(&video_frame(80, SPS_A)) > 0);

        let tags = tags.lock();
        let (_, ts_first, _) = parse_tag(&tags[3]);
        let (_, ts_second, _) = parse_tag(&tags[4]);
        assert_eq!(ts_first, 100);
        assert_eq!(ts_second, 100);
    }

    #[test]
    fn sps_change_reemits_sequence_header() {
        let stream = MockStream::new();
        let tags = Arc::clone(&stream.tags);
        let (session, _) = session_with(stream);

        session.init_metadata(&full_media_info(), 1024);
        assert!(session.send_packet(&video_frame(0, SPS_A)) > 0);
        assert!(session.send_packet(&video_frame(100, SPS_A)) > 0);

        let mut updated = full_media_info();
        updated.sps = Bytes::from_static(SPS_B);
        session.init_metadata(&updated, 1024);
        assert!(session.send_packet(&video_frame(133, SPS_B)) > 0);

        let tags = tags.lock();
        // 4 tags from the first generation + media, then a fresh header set.
        let (tag_type, ts, payload) = parse_tag(&tags[6]);
        assert_eq!(tag_type, 0x09);
        assert_eq!(&payload[..2], &[0x17, 0x00]);
        assert_eq!(payload[6], SPS_B[1]);
        // Re-emitted headers ride the watermark, not zero.
        assert_eq!(ts, 100);

        let (media_type, media_ts, media_payload) = parse_tag(&tags[8]);
        assert_eq!(media_type, 0x09);
        assert_eq!(media_ts, 133);
        assert_eq!(media_payload[1], 0x01);
    }

    #[test]
    fn adts_header_is_stripped_from_audio_tags() {
        let stream = MockStream::new();
        let tags = Arc::clone(&stream.tags);
        let (session, _) = session_with(stream);

        let mut info = full_media_info();
        info.sps = Bytes::new();
        info.pps = Bytes::new();
        info.video_codec = VideoCodec::None;
        session.init_metadata(&info, 1024);

        let raw = [0x21, 0x19, 0x2E];
        let mut adts = vec![0xFF, 0xF1, 0x50, 0x80, 0x00, 0x1F, 0xFC];
        adts.extend_from_slice(&raw);
        assert!(session.send_packet(&audio_frame(0, &adts)) > 0);

        let tags = tags.lock();
        // onMetaData + AAC sequence header + media
        assert_eq!(tags.len(), 3);
        let (tag_type, _, payload) = parse_tag(&tags[2]);
        assert_eq!(tag_type, 0x08);
        assert_eq!(payload[0], 0xAF);
        assert_eq!(payload[1], 0x01);
        assert_eq!(&payload[2..], &raw);
    }

    #[test]
    fn write_failure_notifies_error_and_disconnects() {
        // Audio-only headers take two tags; the third (first media) fails.
        let stream = MockStream::failing_after(2);
        let tags = Arc::clone(&stream.tags);
        let (session, states) = session_with(stream);

        let mut info = full_media_info();
        info.sps = Bytes::new();
        info.pps = Bytes::new();
        info.video_codec = VideoCodec::None;
        session.init_metadata(&info, 1024);

        assert_eq!(session.send_packet(&audio_frame(0, &[0x21, 0x42])), 0);
        assert!(states.lock().contains(&PublishState::Error));
        assert!(!session.is_connected());

        // The session stays down; later sends are rejected outright.
        assert_eq!(session.send_packet(&audio_frame(10, &[0x21, 0x42])), 0);
        assert_eq!(tags.lock().len(), 2);
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let session = PublishSession::new();
        session.init_metadata(&full_media_info(), 1024);
        assert_eq!(session.send_packet(&video_frame(0, SPS_A)), 0);
    }

    #[test]
    fn release_notifies_disconnected() {
        let (session, states) = session_with(MockStream::new());
        session.release();
        assert_eq!(states.lock().last(), Some(&PublishState::Disconnected));
        assert!(!session.is_connected());
    }

    #[test]
    fn metadata_advertises_only_present_fields() {
        // Audio-only: no width/height/framerate/videocodecid.
        let info = MediaInfo {
            audio_codec: AudioCodec::Aac,
            audio_sample_rate: 44100,
            audio_channels: 1,
            audio_bits_per_sample: 16,
            ..MediaInfo::default()
        };
        let mut buf = [0u8; METADATA_BUFFER_LEN];
        let len = encode_metadata(&info, &mut buf).unwrap();
        let payload = &buf[..len];

        // audiocodecid + 3 audio fields + both datarate placeholders.
        assert_eq!(&payload[14..18], &[0x00, 0x00, 0x00, 0x06]);
        let as_text = String::from_utf8_lossy(payload);
        assert!(!as_text.contains("videocodecid"));
        assert!(as_text.contains("audiocodecid"));
        assert!(as_text.contains("audiosamplerate"));
    }
}
