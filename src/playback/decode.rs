//! Raw PCM to timed audio segments.
//!
//! Both ends agree on interleaved s16le at a fixed rate and channel count,
//! so decoding is a pure reinterpretation of bytes. Chunks are accumulated
//! until a minimum size so the scheduler never deals with tiny buffers.

use std::time::Duration;

const BYTES_PER_SAMPLE: usize = 2;

/// Decoded, interleaved audio ready to be scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSegment {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames() as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("chunk of {len} bytes is not a whole number of {frame_bytes}-byte frames")]
    Misaligned { len: usize, frame_bytes: usize },
}

#[derive(Debug)]
pub struct PcmDecoder {
    sample_rate: u32,
    channels: u16,
    min_bytes: usize,
    pending: Vec<u8>,
    consecutive_failures: u32,
    max_failures: u32,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, channels: u16, min_bytes: usize, max_failures: u32) -> Self {
        Self {
            sample_rate,
            channels,
            min_bytes,
            pending: Vec::with_capacity(min_bytes),
            consecutive_failures: 0,
            max_failures,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels.max(1) as usize * BYTES_PER_SAMPLE
    }

    /// Add one received chunk. Returns a segment once enough bytes are
    /// buffered. A malformed chunk is discarded without touching what is
    /// already buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<AudioSegment>, DecodeError> {
        let frame_bytes = self.frame_bytes();
        if chunk.len() % frame_bytes != 0 {
            self.consecutive_failures += 1;
            return Err(DecodeError::Misaligned {
                len: chunk.len(),
                frame_bytes,
            });
        }

        self.consecutive_failures = 0;
        self.pending.extend_from_slice(chunk);

        if self.pending.len() < self.min_bytes.max(frame_bytes) {
            return Ok(None);
        }
        Ok(self.flush())
    }

    /// Decode whatever whole frames are buffered.
    pub fn flush(&mut self) -> Option<AudioSegment> {
        let whole = self.pending.len() - self.pending.len() % self.frame_bytes();
        if whole == 0 {
            return None;
        }

        let samples = self.pending[..whole]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();
        self.pending.drain(..whole);

        Some(AudioSegment {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }

    /// Whether decode failures have persisted long enough to treat the
    /// connection as broken.
    pub fn failures_exceeded(&self) -> bool {
        self.consecutive_failures > self.max_failures
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.consecutive_failures = 0;
    }
}
