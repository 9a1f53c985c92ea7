//! Sine tone generator, exposed as a decode backend so calibration tones and
//! tests travel the same path as real media.

use std::f32::consts::TAU;
use std::time::Duration;

use harmony_core::{Error, Result, TrackSource};

use crate::adapter::{DecodeBackend, DecodedStream};

/// Samples generated per packet.
const PACKET_LEN: usize = 1024;

/// Peak amplitude of generated tones (-6 dBFS).
const AMPLITUDE: f32 = 0.5;

/// Generates mono sine tones at a fixed rate.
#[derive(Debug, Clone, Copy)]
pub struct ToneBackend {
    sample_rate: u32,
}

impl Default for ToneBackend {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
        }
    }
}

impl ToneBackend {
    /// Generate at `sample_rate` instead of 48 kHz.
    pub const fn with_sample_rate(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl DecodeBackend for ToneBackend {
    fn open(&self, source: &TrackSource) -> Result<Box<dyn DecodedStream>> {
        let TrackSource::Tone {
            frequency_hz,
            duration,
        } = source
        else {
            return Err(Error::UnsupportedFormat(format!("{source} is not a tone")));
        };

        let total = (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as u64;
        Ok(Box::new(ToneStream {
            sample_rate: self.sample_rate,
            frequency_hz: *frequency_hz,
            duration: *duration,
            total,
            cursor: 0,
        }))
    }
}

struct ToneStream {
    sample_rate: u32,
    frequency_hz: f32,
    duration: Duration,
    total: u64,
    cursor: u64,
}

impl DecodedStream for ToneStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        1
    }

    fn duration(&self) -> Option<Duration> {
        Some(self.duration)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn next_packet(&mut self) -> Result<Option<Vec<f32>>> {
        if self.cursor >= self.total {
            return Ok(None);
        }

        let end = (self.cursor + PACKET_LEN as u64).min(self.total);
        let step = self.frequency_hz / self.sample_rate as f32;
        let packet = (self.cursor..end)
            .map(|n| {
                // Phase wrapped per sample to keep precision on long tones.
                let phase = (n as f64 * f64::from(step)).fract() as f32;
                AMPLITUDE * (TAU * phase).sin()
            })
            .collect();

        self.cursor = end;
        Ok(Some(packet))
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.cursor =
            ((position.as_secs_f64() * f64::from(self.sample_rate)).round() as u64).min(self.total);
        Ok(())
    }
}
