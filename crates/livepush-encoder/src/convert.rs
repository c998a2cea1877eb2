//! PCM format conversion and resampling.
//!
//! The AAC encoder consumes interleaved signed 16-bit samples at a fixed
//! rate and channel count. Capture hands us whatever the device produces,
//! so this converter maps sample format (F32 -> S16), channel layout
//! (mono <-> stereo) and, when the rates differ, resamples by linear
//! interpolation with the fractional position carried across chunks.

use tracing::debug;

use crate::{PcmFrame, SampleFormat};

/// Converts capture PCM into the encoder's sample geometry.
pub struct PcmConverter {
    src_format: SampleFormat,
    src_rate: u32,
    src_channels: u32,
    dst_rate: u32,
    dst_channels: u32,
    /// Fractional read position into the source stream, carried across
    /// chunks so resampling stays continuous.
    phase: f64,
    /// Last source frame of the previous chunk, one sample per channel.
    tail: Vec<f32>,
}

impl PcmConverter {
    pub fn new(
        src_format: SampleFormat,
        src_rate: u32,
        src_channels: u32,
        dst_rate: u32,
        dst_channels: u32,
    ) -> Self {
        debug!(
            ?src_format,
            src_rate, src_channels, dst_rate, dst_channels, "building PCM converter"
        );
        Self {
            src_format,
            src_rate,
            src_channels,
            dst_rate,
            dst_channels,
            phase: 0.0,
            tail: Vec::new(),
        }
    }

    /// Whether this converter still matches the given input geometry.
    pub fn matches(&self, frame: &PcmFrame) -> bool {
        self.src_format == frame.format
            && self.src_rate == frame.sample_rate
            && self.src_channels == frame.channels
    }

    /// Convert one capture chunk into interleaved S16 at the destination
    /// rate and channel count.
    pub fn convert(&mut self, frame: &PcmFrame) -> Vec<i16> {
        let frames = match frame.frame_count() {
            Some(count) => count,
            None => return Vec::new(),
        };

        // Decode to f32, mapped to the destination channel count.
        let mut samples = Vec::with_capacity(frames * self.dst_channels as usize);
        for i in 0..frames {
            self.push_mapped_frame(frame, i, &mut samples);
        }

        let converted = if self.src_rate == self.dst_rate {
            samples
        } else {
            self.resample(&samples)
        };

        converted.iter().map(|&s| f32_to_i16(s)).collect()
    }

    fn push_mapped_frame(&self, frame: &PcmFrame, index: usize, out: &mut Vec<f32>) {
        let src_ch = self.src_channels as usize;
        let sample = |ch: usize| read_sample(frame, index * src_ch + ch);

        match (self.src_channels, self.dst_channels) {
            (a, b) if a == b => {
                for ch in 0..src_ch {
                    out.push(sample(ch));
                }
            }
            (1, _) => {
                let mono = sample(0);
                for _ in 0..self.dst_channels {
                    out.push(mono);
                }
            }
            (_, 1) => {
                let sum: f32 = (0..src_ch).map(sample).sum();
                out.push(sum / src_ch as f32);
            }
            _ => {
                // Take the first destination channels, padding with the last.
                for ch in 0..self.dst_channels as usize {
                    out.push(sample(ch.min(src_ch - 1)));
                }
            }
        }
    }

    /// Linear-interpolation resampling of interleaved f32 samples.
    fn resample(&mut self, input: &[f32]) -> Vec<f32> {
        let channels = self.dst_channels as usize;
        let in_frames = input.len() / channels;
        if in_frames == 0 {
            return Vec::new();
        }

        let step = self.src_rate as f64 / self.dst_rate as f64;
        let tail = std::mem::take(&mut self.tail);
        let have_tail = !tail.is_empty();
        // With a tail, position 0.0 is the tail frame and 1.0 the first
        // frame of this chunk; without one, 0.0 is the first frame.
        let total_frames = in_frames + usize::from(have_tail);

        let frame_at = |pos: usize, ch: usize| -> f32 {
            if have_tail && pos == 0 {
                tail[ch]
            } else {
                let idx = pos - usize::from(have_tail);
                input[idx * channels + ch]
            }
        };

        let mut out = Vec::new();
        let mut pos = self.phase;
        while pos < (total_frames - 1) as f64 {
            let base = pos as usize;
            let frac = (pos - base as f64) as f32;
            for ch in 0..channels {
                let a = frame_at(base, ch);
                let b = frame_at(base + 1, ch);
                out.push(a + (b - a) * frac);
            }
            pos += step;
        }

        self.phase = pos - (total_frames - 1) as f64;
        self.tail = (0..channels)
            .map(|ch| frame_at(total_frames - 1, ch))
            .collect();
        out
    }
}

fn read_sample(frame: &PcmFrame, index: usize) -> f32 {
    match frame.format {
        SampleFormat::S16 => {
            let off = index * 2;
            i16::from_le_bytes([frame.data[off], frame.data[off + 1]]) as f32 / 32768.0
        }
        SampleFormat::F32 => {
            let off = index * 4;
            f32::from_le_bytes([
                frame.data[off],
                frame.data[off + 1],
                frame.data[off + 2],
                frame.data[off + 3],
            ])
        }
    }
}

/// Convert one f32 sample to i16 with clamping.
fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn f32_frame(rate: u32, channels: u32, samples: &[f32]) -> PcmFrame {
        let mut data = Vec::with_capacity(samples.len() * 4);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        PcmFrame {
            format: SampleFormat::F32,
            sample_rate: rate,
            channels,
            data: Bytes::from(data),
        }
    }

    fn s16_frame(rate: u32, channels: u32, samples: &[i16]) -> PcmFrame {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        PcmFrame {
            format: SampleFormat::S16,
            sample_rate: rate,
            channels,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn s16_passthrough() {
        let mut conv = PcmConverter::new(SampleFormat::S16, 48000, 2, 48000, 2);
        let out = conv.convert(&s16_frame(48000, 2, &[100, -100, 2000, -2000]));
        assert_eq!(out.len(), 4);
        assert!((out[0] - 100).abs() <= 1);
        assert!((out[3] + 2000).abs() <= 1);
    }

    #[test]
    fn f32_converts_and_clamps() {
        let mut conv = PcmConverter::new(SampleFormat::F32, 48000, 1, 48000, 1);
        let out = conv.convert(&f32_frame(48000, 1, &[0.0, 1.0, -1.0, 2.0]));
        assert_eq!(out, vec![0, 32767, -32767, 32767]);
    }

    #[test]
    fn mono_duplicates_to_stereo() {
        let mut conv = PcmConverter::new(SampleFormat::F32, 48000, 1, 48000, 2);
        let out = conv.convert(&f32_frame(48000, 1, &[0.5, -0.5]));
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[2], out[3]);
    }

    #[test]
    fn stereo_averages_to_mono() {
        let mut conv = PcmConverter::new(SampleFormat::F32, 48000, 2, 48000, 1);
        let out = conv.convert(&f32_frame(48000, 2, &[1.0, 0.0, -1.0, -1.0]));
        assert_eq!(out.len(), 2);
        assert!((out[0] as f32 / 32767.0 - 0.5).abs() < 0.01);
        assert!((out[1] as f32 / 32767.0 + 1.0).abs() < 0.01);
    }

    #[test]
    fn upsampling_doubles_sample_count() {
        let mut conv = PcmConverter::new(SampleFormat::F32, 24000, 1, 48000, 1);
        let chunks = [
            f32_frame(24000, 1, &[0.0; 240]),
            f32_frame(24000, 1, &[0.0; 240]),
            f32_frame(24000, 1, &[0.0; 240]),
        ];
        let total: usize = chunks.iter().map(|c| conv.convert(c).len()).sum();
        // 720 input frames at a 1:2 ratio; interpolation may hold back a
        // frame at the boundary.
        assert!((1438..=1440).contains(&total), "got {total}");
    }

    #[test]
    fn downsampling_halves_sample_count() {
        let mut conv = PcmConverter::new(SampleFormat::F32, 48000, 1, 24000, 1);
        let total: usize = (0..3)
            .map(|_| conv.convert(&f32_frame(48000, 1, &[0.0; 480])).len())
            .sum();
        assert!((718..=720).contains(&total), "got {total}");
    }

    #[test]
    fn mismatched_length_yields_nothing() {
        let mut conv = PcmConverter::new(SampleFormat::S16, 48000, 2, 48000, 2);
        let frame = PcmFrame {
            format: SampleFormat::S16,
            sample_rate: 48000,
            channels: 2,
            data: Bytes::from_static(&[0x00, 0x01, 0x02]),
        };
        assert!(conv.convert(&frame).is_empty());
    }
}
