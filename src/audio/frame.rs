//! Sample blocks flowing from the capture graph to the transport
//!
//! The capture callback hands the processing graph whatever the audio backend
//! delivered; `BlockAssembler` re-slices that into blocks of exactly
//! `block_size` samples so every outbound message has the same length.

use std::fmt;

/// One fixed-size block of mono samples in [-1.0, 1.0].
#[derive(Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<f32>> for AudioFrame {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}

// Frames travel inside state machine events, which get logged.
impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AudioFrame({} samples)", self.samples.len())
    }
}

/// PCM16 rendition of an `AudioFrame`, same length and order.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    samples: Vec<i16>,
}

impl EncodedFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian byte image, sent as one binary message.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedFrame({} samples)", self.samples.len())
    }
}

/// Accumulates mono samples and emits blocks of exactly `block_size`.
///
/// Samples left over when the graph is torn down are dropped, never flushed
/// as a short block.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Append samples, calling `emit` once per completed block.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            emit(AudioFrame::new(block));
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
