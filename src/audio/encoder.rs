//! Float → PCM16 conversion for outbound frames

use super::frame::{AudioFrame, EncodedFrame};

/// Convert one sample: `clamp(round(v * 32767), -32768, 32767)`.
///
/// Out-of-range input clamps instead of wrapping. NaN encodes as silence.
pub fn encode_sample(v: f32) -> i16 {
    if v.is_nan() {
        return 0;
    }
    (v * i16::MAX as f32)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a whole frame, preserving length and order.
pub fn encode(frame: &AudioFrame) -> EncodedFrame {
    EncodedFrame::new(frame.samples().iter().map(|&v| encode_sample(v)).collect())
}
