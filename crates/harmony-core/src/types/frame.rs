//! PCM frame types.

use std::time::Duration;

use crate::{Error, Result};

/// Layout shared by every frame the engine moves around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Samples per channel in one frame.
    pub frame_len: usize,
}

impl FrameFormat {
    /// Create a format, rejecting degenerate layouts.
    pub fn new(sample_rate: u32, channels: u16, frame_len: usize) -> Result<Self> {
        if sample_rate == 0 || channels == 0 || frame_len == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid frame format: {sample_rate} Hz, {channels} channels, {frame_len} samples"
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            frame_len,
        })
    }

    /// Interleaved samples in one frame.
    pub const fn samples_per_frame(&self) -> usize {
        self.frame_len * self.channels as usize
    }

    /// Wall-clock length of one frame.
    pub fn frame_duration(&self) -> Duration {
        self.samples_to_duration(self.frame_len as u64)
    }

    /// Convert a per-channel sample count to a duration.
    pub fn samples_to_duration(&self, samples: u64) -> Duration {
        Duration::from_secs_f64(samples as f64 / f64::from(self.sample_rate))
    }

    /// Convert a duration to a per-channel sample count (rounded).
    pub fn duration_to_samples(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as u64
    }

    /// Number of whole frames needed to cover `duration`.
    pub fn frames_for(&self, duration: Duration) -> usize {
        let samples = self.duration_to_samples(duration);
        samples.div_ceil(self.frame_len as u64) as usize
    }
}

impl Default for FrameFormat {
    /// 48 kHz stereo, 10 ms frames.
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_len: 480,
        }
    }
}

/// A fixed-length block of interleaved samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    samples: Box<[f32]>,
    /// Position of the first sample, in per-channel samples from track start.
    pub position: u64,
}

impl Frame {
    /// Allocate a silent frame for `format`.
    pub fn silence(format: &FrameFormat) -> Self {
        Self {
            samples: vec![0.0; format.samples_per_frame()].into_boxed_slice(),
            position: 0,
        }
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Mutable interleaved samples.
    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Zero all samples in place.
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
    }

    /// True if every sample is exactly zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }

    /// Peak absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}
