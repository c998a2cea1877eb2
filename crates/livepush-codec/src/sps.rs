//! H.264 SPS parsing, just enough to recover the coded resolution.
//!
//! The publisher advertises `width`/`height` in `onMetaData`. Servers
//! tolerate zeros there, so every failure path returns `None` and the
//! caller falls back to 0 rather than failing the publish.

use tracing::trace;

/// Exp-Golomb bit reader over an RBSP buffer.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    /// Unsigned Exp-Golomb code.
    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some((1u32 << leading_zeros) - 1 + suffix)
    }

    /// Signed Exp-Golomb code.
    fn read_se(&mut self) -> Option<i32> {
        let code = self.read_ue()?;
        let value = code.div_ceil(2) as i32;
        Some(if code % 2 == 0 { -value } else { value })
    }
}

/// Remove emulation-prevention bytes (00 00 03 -> 00 00).
fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0u32;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0x00 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: u32) -> Option<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Some(())
}

/// Parse an SPS NAL unit (header byte included) into `(width, height)`.
pub fn parse_resolution(sps: &[u8]) -> Option<(u32, u32)> {
    if sps.len() < 4 || sps[0] & 0x1F != 7 {
        return None;
    }

    let rbsp = strip_emulation_prevention(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint flags + reserved
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()? == 1;
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            let lists = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycle_len = r.read_ue()?;
        for _ in 0..cycle_len {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let mut width = pic_width_in_mbs * 16;
    let mut height = (2 - frame_mbs_only) * pic_height_in_map_units * 16;

    if r.read_bit()? == 1 {
        // frame_cropping_flag
        let crop_left = r.read_ue()?;
        let crop_right = r.read_ue()?;
        let crop_top = r.read_ue()?;
        let crop_bottom = r.read_ue()?;

        let (sub_width, sub_height) = match chroma_format_idc {
            0 => (1, 1),
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let (crop_unit_x, crop_unit_y) = if chroma_format_idc == 0 || separate_colour_plane {
            (1, 2 - frame_mbs_only)
        } else {
            (sub_width, sub_height * (2 - frame_mbs_only))
        };

        width = width.checked_sub((crop_left + crop_right) * crop_unit_x)?;
        height = height.checked_sub((crop_top + crop_bottom) * crop_unit_y)?;
    }

    trace!(width, height, "parsed SPS resolution");
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MSB-first bit writer used to synthesize SPS test vectors.
    struct BitWriter {
        bytes: Vec<u8>,
        used: u32,
    }

    impl BitWriter {
        fn new() -> Self {
            Self { bytes: Vec::new(), used: 0 }
        }

        fn put_bit(&mut self, bit: u32) {
            if self.used % 8 == 0 {
                self.bytes.push(0);
            }
            let last = self.bytes.len() - 1;
            self.bytes[last] |= ((bit & 1) as u8) << (7 - (self.used % 8));
            self.used += 1;
        }

        fn put_bits(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                self.put_bit((value >> i) & 1);
            }
        }

        fn put_ue(&mut self, value: u32) {
            let coded = value + 1;
            let bits = 32 - coded.leading_zeros();
            self.put_bits(0, bits - 1);
            self.put_bits(coded, bits);
        }

        /// Insert emulation-prevention bytes and prepend the NAL header.
        fn into_sps(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.put_bit(1);
            while self.used % 8 != 0 {
                self.put_bit(0);
            }

            let mut out = vec![0x67];
            let mut zeros = 0u32;
            for byte in self.bytes {
                if zeros >= 2 && byte <= 0x03 {
                    out.push(0x03);
                    zeros = 0;
                }
                if byte == 0x00 {
                    zeros += 1;
                } else {
                    zeros = 0;
                }
                out.push(byte);
            }
            out
        }
    }

    fn baseline_sps(width_mbs: u32, height_map_units: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(66, 8); // profile_idc: baseline
        w.put_bits(0, 8); // constraint flags
        w.put_bits(30, 8); // level_idc
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type
        w.put_ue(0); // log2_max_pic_order_cnt_lsb_minus4
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(0); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(width_mbs - 1);
        w.put_ue(height_map_units - 1);
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(1); // direct_8x8_inference_flag
        if crop_bottom > 0 {
            w.put_bit(1); // frame_cropping_flag
            w.put_ue(0);
            w.put_ue(0);
            w.put_ue(0);
            w.put_ue(crop_bottom);
        } else {
            w.put_bit(0);
        }
        w.put_bit(0); // vui_parameters_present_flag
        w.into_sps()
    }

    #[test]
    fn parses_uncropped_resolution() {
        // 80x45 macroblocks = 1280x720
        let sps = baseline_sps(80, 45, 0);
        assert_eq!(parse_resolution(&sps), Some((1280, 720)));
    }

    #[test]
    fn applies_frame_cropping() {
        // 120x68 macroblocks with 8 luma rows cropped = 1920x1080
        let sps = baseline_sps(120, 68, 4);
        assert_eq!(parse_resolution(&sps), Some((1920, 1080)));
    }

    #[test]
    fn parses_high_profile_chroma_fields() {
        let mut w = BitWriter::new();
        w.put_bits(100, 8); // profile_idc: high
        w.put_bits(0, 8);
        w.put_bits(31, 8);
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(1); // chroma_format_idc: 4:2:0
        w.put_ue(0); // bit_depth_luma_minus8
        w.put_ue(0); // bit_depth_chroma_minus8
        w.put_bit(0); // qpprime_y_zero_transform_bypass_flag
        w.put_bit(0); // seq_scaling_matrix_present_flag
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(2); // pic_order_cnt_type
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(0);
        w.put_ue(39); // 40 mbs = 640
        w.put_ue(29); // 30 map units = 480
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(1);
        w.put_bit(0); // frame_cropping_flag
        w.put_bit(0);
        let sps = w.into_sps();

        assert_eq!(parse_resolution(&sps), Some((640, 480)));
    }

    #[test]
    fn rejects_non_sps_nal() {
        assert_eq!(parse_resolution(&[0x68, 0xCE, 0x3C, 0x80]), None);
        assert_eq!(parse_resolution(&[0x67, 0x42]), None);
    }
}
