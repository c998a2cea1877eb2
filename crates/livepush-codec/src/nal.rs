//! NAL unit parsing and AVCC conversion.
//!
//! H.264 arrives from software encoders in Annex B form, with NAL units
//! separated by 0x000001 or 0x00000001 start codes. FLV carries AVCC
//! instead: every NAL unit prefixed by its 4-byte big-endian length. This
//! module splits Annex B streams, tracks SPS/PPS parameter sets, converts
//! between the two packaging forms and builds the AVC decoder
//! configuration record used in the video sequence header.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// NAL unit types relevant for publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

/// Lazy iterator over the NAL units of an Annex B stream.
///
/// Yields each NAL payload (header byte included, start code stripped).
/// Both 3- and 4-byte start codes are accepted; garbage before the first
/// start code is skipped.
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NalUnits<'a> {
    fn start_code_len(data: &[u8], i: usize) -> Option<usize> {
        if i + 4 <= data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            Some(4)
        } else if i + 3 <= data.len() && data[i..i + 3] == [0, 0, 1] {
            Some(3)
        } else {
            None
        }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        // Find the next start code.
        let mut start = None;
        let mut i = self.pos;
        while i + 3 <= self.data.len() {
            if let Some(sc_len) = Self::start_code_len(self.data, i) {
                start = Some(i + sc_len);
                break;
            }
            i += 1;
        }
        let nal_start = start?;

        // The NAL runs to the next start code or the end of the buffer.
        let mut nal_end = self.data.len();
        let mut j = nal_start;
        while j + 3 <= self.data.len() {
            if Self::start_code_len(self.data, j).is_some() {
                nal_end = j;
                break;
            }
            j += 1;
        }

        self.pos = nal_end;
        if nal_end > nal_start {
            Some(&self.data[nal_start..nal_end])
        } else {
            self.next()
        }
    }
}

/// Split an Annex B byte stream into NAL units without copying.
pub fn split_annex_b(data: &[u8]) -> NalUnits<'_> {
    NalUnits { data, pos: 0 }
}

/// Convert an Annex B stream to AVCC with 4-byte big-endian length prefixes.
///
/// Returns an empty buffer when the input holds no complete NAL unit.
pub fn annex_b_to_avcc(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    for nal in split_annex_b(data) {
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
    }
    buf.freeze()
}

/// Convert an AVCC stream back to Annex B with 4-byte start codes.
///
/// Stops at the first truncated length prefix.
pub fn avcc_to_annex_b(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    let mut i = 0;
    while i + 4 <= data.len() {
        let len = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
        i += 4;
        if i + len > data.len() {
            break;
        }
        buf.put_slice(&[0, 0, 0, 1]);
        buf.put_slice(&data[i..i + len]);
        i += len;
    }
    buf.freeze()
}

/// Result of scanning an access unit for parameter sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanResult {
    /// Whether the stored SPS or PPS changed.
    pub updated: bool,
    /// Whether the access unit contains an IDR slice.
    pub has_idr: bool,
}

/// The most recently seen SPS and PPS of a stream.
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSets {
    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Scan an Annex B access unit, updating the stored SPS/PPS.
    ///
    /// A stored parameter set is replaced only when the newly seen NAL is
    /// byte-different; `updated` reports whether either one changed, so a
    /// repeated in-band SPS/PPS does not force a sequence-header resend.
    pub fn scan(&mut self, annex_b: &[u8]) -> ScanResult {
        let mut result = ScanResult::default();
        for nal in split_annex_b(annex_b) {
            match NalUnitType::from(nal[0]) {
                NalUnitType::IdrSlice => result.has_idr = true,
                NalUnitType::Sps => {
                    if self.sps.as_deref() != Some(nal) {
                        debug!(len = nal.len(), "SPS changed");
                        self.sps = Some(Bytes::copy_from_slice(nal));
                        result.updated = true;
                    }
                }
                NalUnitType::Pps => {
                    if self.pps.as_deref() != Some(nal) {
                        debug!(len = nal.len(), "PPS changed");
                        self.pps = Some(Bytes::copy_from_slice(nal));
                        result.updated = true;
                    }
                }
                _ => {}
            }
        }
        result
    }
}

/// Build an AVC decoder configuration record from SPS and PPS.
///
/// This is the payload of the video sequence header that must precede any
/// video frame (ISO 14496-15):
///
/// - configurationVersion: 0x01
/// - AVCProfileIndication / profile_compatibility / AVCLevelIndication:
///   SPS bytes 1..4
/// - lengthSizeMinusOne: 0xFF (4-byte NAL lengths)
/// - numOfSequenceParameterSets: 0xE1 (one SPS)
/// - u16 SPS length + SPS, 0x01, u16 PPS length + PPS
pub fn avc_decoder_config(sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    if sps.len() < 4 || pps.is_empty() {
        debug!(sps_len = sps.len(), pps_len = pps.len(), "SPS/PPS too short");
        return None;
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01);
    buf.put_u8(sps[1]);
    buf.put_u8(sps[2]);
    buf.put_u8(sps[3]);
    buf.put_u8(0xFF);
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);

    Some(buf.freeze())
}
