//! AAC-LC encoder adapter built on fdk-aac.
//!
//! Capture PCM goes through a [`PcmConverter`] into a sample FIFO; whole
//! encoder frames are drained, encoded and delivered through the
//! registered callback. Timestamps are derived purely from the number of
//! samples handed to the callback (`samples_sent * 1e6 / rate`), never
//! from a wall clock, so audio PTS is monotonic and gap-free regardless
//! of capture jitter.

use std::collections::VecDeque;

use tracing::{debug, instrument, trace, warn};

use crate::convert::PcmConverter;
use crate::error::EncoderError;
use crate::{AudioEncoderConfig, EncodedFrameCallback, EncoderResult, PcmFrame};

/// Default AAC frame length in samples per channel.
const DEFAULT_FRAME_LEN: usize = 1024;

/// AAC encoding pipeline: converter + FIFO + fdk-aac.
pub struct AacEncoder {
    // Field order is drop order: FIFO, converter, then the codec.
    fifo: VecDeque<i16>,
    converter: Option<PcmConverter>,
    encoder: Option<fdk_aac::enc::Encoder>,
    config: AudioEncoderConfig,
    frame_len: usize,
    output_buffer: Vec<u8>,
    samples_sent: u64,
    callback: Option<EncodedFrameCallback>,
}

impl AacEncoder {
    /// Create an uninitialized pipeline; the codec opens lazily on the
    /// first PCM frame (or an explicit [`init`](Self::init)).
    pub fn new(bitrate_kbps: u32) -> Self {
        Self {
            fifo: VecDeque::new(),
            converter: None,
            encoder: None,
            config: AudioEncoderConfig {
                bitrate_kbps,
                ..AudioEncoderConfig::default()
            },
            frame_len: DEFAULT_FRAME_LEN,
            output_buffer: Vec::new(),
            samples_sent: 0,
            callback: None,
        }
    }

    /// Install the encoded-frame callback.
    pub fn register_callback(&mut self, callback: EncodedFrameCallback) {
        self.callback = Some(callback);
    }

    /// Open the AAC-LC codec for the given input geometry. Idempotent.
    #[instrument(name = "aac_init", skip(self))]
    pub fn init(&mut self, sample_rate: u32, channels: u32) -> EncoderResult<()> {
        if self.encoder.is_some() {
            return Ok(());
        }

        // fdk encodes mono or stereo; anything wider is downmixed by the
        // converter.
        let channels = channels.clamp(1, 2);
        let channel_mode = if channels == 1 {
            fdk_aac::enc::ChannelMode::Mono
        } else {
            fdk_aac::enc::ChannelMode::Stereo
        };

        let params = fdk_aac::enc::EncoderParams {
            bit_rate: fdk_aac::enc::BitRate::Cbr(self.config.bitrate_kbps * 1000),
            sample_rate,
            transport: fdk_aac::enc::Transport::Raw,
            channels: channel_mode,
        };

        let encoder = fdk_aac::enc::Encoder::new(params)
            .map_err(|e| EncoderError::Initialization(format!("fdk-aac init failed: {e:?}")))?;

        let info = encoder
            .info()
            .map_err(|e| EncoderError::Initialization(format!("fdk-aac info failed: {e:?}")))?;

        self.frame_len = if info.frameLength > 0 {
            info.frameLength as usize
        } else {
            DEFAULT_FRAME_LEN
        };
        self.output_buffer = vec![0u8; info.maxOutBufBytes as usize];
        self.fifo
            .reserve(self.frame_len * channels as usize * 4);

        debug!(
            sample_rate,
            channels,
            frame_len = self.frame_len,
            max_out = info.maxOutBufBytes,
            "AAC encoder initialized"
        );

        self.config.sample_rate = sample_rate;
        self.config.channels = channels;
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Sample rate the codec runs at.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Encoder frame length in samples per channel.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Feed one chunk of capture PCM, encoding every complete frame that
    /// becomes available.
    ///
    /// A chunk whose byte length does not match its declared layout is
    /// dropped without error so capture-side mismatches stay non-fatal.
    pub fn push_pcm(&mut self, frame: &PcmFrame) -> EncoderResult<()> {
        if self.encoder.is_none() {
            self.init(frame.sample_rate, frame.channels)?;
        }

        if frame.frame_count().is_none() {
            trace!(
                len = frame.data.len(),
                channels = frame.channels,
                "dropping PCM chunk with mismatched layout"
            );
            return Ok(());
        }

        if !self.converter.as_ref().is_some_and(|c| c.matches(frame)) {
            self.converter = Some(PcmConverter::new(
                frame.format,
                frame.sample_rate,
                frame.channels,
                self.config.sample_rate,
                self.config.channels,
            ));
        }

        let converted = match self.converter.as_mut() {
            Some(converter) => converter.convert(frame),
            None => Vec::new(),
        };
        self.fifo.extend(converted);

        let frame_samples = self.frame_len * self.config.channels as usize;
        let mut frame_buf = Vec::with_capacity(frame_samples);
        while self.fifo.len() >= frame_samples {
            frame_buf.clear();
            frame_buf.extend(self.fifo.drain(..frame_samples));
            self.encode_frame(&frame_buf)?;
        }

        Ok(())
    }

    fn encode_frame(&mut self, samples: &[i16]) -> EncoderResult<()> {
        let Some(encoder) = self.encoder.as_ref() else {
            return Ok(());
        };
        let info = encoder
            .encode(samples, &mut self.output_buffer)
            .map_err(|e| EncoderError::EncodeFailed(format!("{e:?}")))?;

        // The codec may buffer ahead before its first packet.
        if info.output_size == 0 {
            return Ok(());
        }

        let pts_us = self.samples_sent * 1_000_000 / self.config.sample_rate as u64;
        let pts_ms = (pts_us / 1000) as u32;
        if let Some(callback) = self.callback.as_mut() {
            callback(&self.output_buffer[..info.output_size], pts_ms, pts_us);
        } else {
            warn!("encoded AAC frame dropped: no callback registered");
        }
        self.samples_sent += self.frame_len as u64;
        Ok(())
    }
}

impl Drop for AacEncoder {
    fn drop(&mut self) {
        debug!(samples_sent = self.samples_sent, "closing AAC encoder");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::SampleFormat;

    fn silence_s16(rate: u32, channels: u32, frames: usize) -> PcmFrame {
        PcmFrame {
            format: SampleFormat::S16,
            sample_rate: rate,
            channels,
            data: Bytes::from(vec![0u8; frames * channels as usize * 2]),
        }
    }

    fn collecting_encoder(bitrate: u32) -> (AacEncoder, Arc<Mutex<Vec<(usize, u32, u64)>>>) {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&packets);
        let mut enc = AacEncoder::new(bitrate);
        enc.register_callback(Box::new(move |data, pts_ms, pts_us| {
            sink.lock().unwrap().push((data.len(), pts_ms, pts_us));
        }));
        (enc, packets)
    }

    #[test]
    fn pts_is_sample_counted() {
        let (mut enc, packets) = collecting_encoder(64);

        for _ in 0..8 {
            enc.push_pcm(&silence_s16(48000, 2, 1024)).unwrap();
        }

        let packets = packets.lock().unwrap();
        assert!(packets.len() >= 4, "only {} packets emitted", packets.len());
        for (n, &(len, pts_ms, pts_us)) in packets.iter().enumerate() {
            assert!(len > 0);
            assert_eq!(pts_us, n as u64 * 1024 * 1_000_000 / 48000);
            assert_eq!(pts_ms as u64, pts_us / 1000);
        }
        // At 48 kHz the packet at index 3 sits at 64 ms exactly.
        assert_eq!(packets[3].2, 64_000);
        assert_eq!(packets[3].1, 64);
    }

    #[test]
    fn init_is_lazy_and_idempotent() {
        let (mut enc, _packets) = collecting_encoder(64);
        assert!(enc.encoder.is_none());

        enc.push_pcm(&silence_s16(44100, 1, 512)).unwrap();
        assert!(enc.encoder.is_some());
        assert_eq!(enc.sample_rate(), 44100);

        // A second init is a no-op and keeps the original geometry.
        enc.init(48000, 2).unwrap();
        assert_eq!(enc.sample_rate(), 44100);
    }

    #[test]
    fn mismatched_chunk_is_a_silent_no_op() {
        let (mut enc, packets) = collecting_encoder(64);
        let bad = PcmFrame {
            format: SampleFormat::S16,
            sample_rate: 48000,
            channels: 2,
            data: Bytes::from_static(&[0x00, 0x01, 0x02]),
        };
        enc.push_pcm(&bad).unwrap();
        assert!(packets.lock().unwrap().is_empty());
    }

    #[test]
    fn input_rate_change_rebuilds_the_converter() {
        let (mut enc, packets) = collecting_encoder(64);

        for _ in 0..4 {
            enc.push_pcm(&silence_s16(48000, 2, 1024)).unwrap();
        }
        // Capture switches to 24 kHz mono mid-stream; output keeps the
        // encoder's 48 kHz stereo timeline.
        for _ in 0..8 {
            enc.push_pcm(&silence_s16(24000, 1, 512)).unwrap();
        }

        let packets = packets.lock().unwrap();
        for (n, &(_, _, pts_us)) in packets.iter().enumerate() {
            assert_eq!(pts_us, n as u64 * 1024 * 1_000_000 / 48000);
        }
    }
}
