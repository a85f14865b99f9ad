//! Bit-shift visualization of raw samples.
//!
//! Raw sensor data delivered without RGB conversion usually sits in the low
//! bits of each sample. Shifting it left moves it into the visible range.

use crate::frame::{RawFrame, Samples};

/// Shift applied when none is configured.
pub const DEFAULT_SHIFT: u32 = 6;

/// An unsigned sample type the shift can operate on.
pub trait Sample: Copy {
    /// `(self << shift) mod 2^BITS`. Shifts of `BITS` or more give zero.
    fn shl_wrapping(self, shift: u32) -> Self;
}

impl Sample for u8 {
    fn shl_wrapping(self, shift: u32) -> Self {
        self.checked_shl(shift).unwrap_or(0)
    }
}

impl Sample for u16 {
    fn shl_wrapping(self, shift: u32) -> Self {
        self.checked_shl(shift).unwrap_or(0)
    }
}

/// Shifts every sample in place.
pub fn shift_samples<T: Sample>(samples: &mut [T], shift: u32) {
    for v in samples.iter_mut() {
        *v = v.shl_wrapping(shift);
    }
}

/// Shifts every sample of `frame` at its native bit width.
///
/// Consumes the frame; the unshifted samples are not kept.
pub fn shift_frame(mut frame: RawFrame, shift: u32) -> RawFrame {
    if shift == 0 {
        return frame;
    }
    match &mut frame.samples {
        Samples::U8(data) => shift_samples(data, shift),
        Samples::U16(data) => shift_samples(data, shift),
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SampleFormat;

    #[test]
    fn test_eight_bit_wraps() {
        assert_eq!(3u8.shl_wrapping(6), 192);
        assert_eq!(4u8.shl_wrapping(6), 0);
        assert_eq!(5u8.shl_wrapping(6), 64);
        assert_eq!(255u8.shl_wrapping(6), 192);
    }

    #[test]
    fn test_sixteen_bit_wraps() {
        // 10-bit full scale lands at the top of the container.
        assert_eq!(1023u16.shl_wrapping(6), 0xFFC0);
        assert_eq!(1024u16.shl_wrapping(6), 0);
        assert_eq!(3u16.shl_wrapping(6), 192);
    }

    #[test]
    fn test_shift_at_or_beyond_width_is_zero() {
        assert_eq!(0xFFu8.shl_wrapping(8), 0);
        assert_eq!(0xFFu8.shl_wrapping(40), 0);
        assert_eq!(0xFFFFu16.shl_wrapping(16), 0);
    }

    #[test]
    fn test_matches_modular_definition_for_all_bytes() {
        for shift in 0..10u32 {
            for v in 0..=255u8 {
                let expected = ((v as u32) << shift) % 256;
                assert_eq!(v.shl_wrapping(shift) as u32, expected, "v={v} shift={shift}");
            }
        }
    }

    #[test]
    fn test_shift_frame_uses_native_width() {
        let narrow = RawFrame::from_bytes(2, 1, SampleFormat::Gray8, vec![3, 4]).unwrap();
        let wide = RawFrame::from_wide(2, 1, SampleFormat::Gray10, vec![3, 4]).unwrap();

        assert_eq!(shift_frame(narrow, 6).samples, Samples::U8(vec![192, 0]));
        assert_eq!(shift_frame(wide, 6).samples, Samples::U16(vec![192, 256]));
    }

    #[test]
    fn test_zero_shift_is_identity() {
        let frame = RawFrame::from_bytes(2, 1, SampleFormat::Gray8, vec![17, 99]).unwrap();
        assert_eq!(shift_frame(frame, 0).samples, Samples::U8(vec![17, 99]));
    }
}
