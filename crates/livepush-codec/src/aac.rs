//! AAC framing utilities.
//!
//! FLV carries raw AAC access units, so ADTS headers coming out of an
//! encoder (or a capture pipeline) are stripped before muxing. The
//! 2-byte AudioSpecificConfig built here goes into the AAC sequence
//! header tag.

/// ADTS `sampling_frequency_index` table.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Map a sample rate to its frequency index, falling back to 44100.
pub fn sample_rate_index(sample_rate: u32) -> u8 {
    SAMPLE_RATES
        .iter()
        .position(|&rate| rate == sample_rate)
        .unwrap_or(4) as u8
}

/// Strip an ADTS header when one is present.
///
/// ADTS starts with the 12-bit syncword 0xFFF; the header is 7 bytes, or
/// 9 when `protection_absent == 0` (CRC present). Input without a header
/// is returned unchanged, as is anything too short to carry one.
pub fn strip_adts(data: &[u8]) -> &[u8] {
    if data.len() < 7 {
        return data;
    }
    if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
        return data;
    }
    let protection_absent = data[1] & 0x01;
    let header_len = if protection_absent == 0 { 9 } else { 7 };
    if data.len() > header_len {
        &data[header_len..]
    } else {
        data
    }
}

/// Build the 2-byte AudioSpecificConfig for AAC-LC.
///
/// Layout: 5 bits object type (2 = LC), 4 bits sampling frequency index,
/// 4 bits channel configuration (clamped to at least 1).
pub fn audio_specific_config(sample_rate: u32, channels: u32) -> [u8; 2] {
    let profile = 2u16; // AAC LC
    let index = sample_rate_index(sample_rate) as u16;
    let channel_config = channels.max(1) as u16;
    let config = (profile << 11) | (index << 7) | (channel_config << 3);
    config.to_be_bytes()
}

/// Build the FLV audio tag header byte for AAC.
///
/// `(SoundFormat 10) << 4 | SoundRate << 2 | SoundSize << 1 | SoundType`,
/// where SoundRate buckets the sample rate (≤11025 -> 1, ≤22050 -> 2,
/// else 3), SoundSize is always 16-bit and SoundType is stereo for two or
/// more channels.
pub fn flv_sound_header(sample_rate: u32, channels: u32) -> u8 {
    let sound_rate = if sample_rate <= 11025 {
        1
    } else if sample_rate <= 22050 {
        2
    } else {
        3
    };
    let sound_size = 1u8; // 16-bit
    let sound_type = u8::from(channels >= 2);
    (10 << 4) | (sound_rate << 2) | (sound_size << 1) | sound_type
}
