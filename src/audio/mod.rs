//! Audio capture module for breath-stream
//!
//! This module handles microphone input capture and PCM16 encoding.
//! Uses CPAL for audio capture.

mod capture;
mod convert;
mod encoder;
mod frame;

pub use capture::{
    list_input_devices, AudioCaptureEngine, CaptureBackend, CaptureConstraints, CaptureError,
    CaptureHandle, CpalCapture, FaultCallback, FrameCallback, InputDeviceInfo,
};
pub use convert::{downmix_to_mono, Decimator};
pub use encoder::{encode, encode_sample};
pub use frame::{AudioFrame, BlockAssembler, EncodedFrame};
