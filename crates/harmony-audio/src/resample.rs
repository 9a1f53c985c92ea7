//! Sample-rate conversion using rubato.
//!
//! Runs on the decode thread only, so it is free to allocate.

use harmony_core::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames handed to rubato per call.
const CHUNK_SIZE: usize = 1024;

/// Converts interleaved audio from a track's native rate to the engine rate.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk.
    pending: Vec<Vec<f32>>,
    /// Leading output frames still to drop (the filter delay).
    skip: usize,
    /// Input frames accepted since creation or the last reset.
    consumed: u64,
    /// Output frames handed out since creation or the last reset.
    produced: u64,
}

impl Resampler {
    /// Create a resampler. Fails if rubato rejects the ratio.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let resampler = FftFixedIn::new(
            input_rate as usize,
            output_rate as usize,
            CHUNK_SIZE,
            2,
            channels,
        )
        .map_err(|e| {
            Error::UnsupportedFormat(format!(
                "cannot resample {input_rate} Hz to {output_rate} Hz: {e}"
            ))
        })?;

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels",
            input_rate, output_rate, channels
        );

        let skip = resampler.output_delay();
        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            pending: vec![Vec::with_capacity(CHUNK_SIZE * 2); channels],
            skip,
            consumed: 0,
            produced: 0,
        })
    }

    /// Get the input sample rate.
    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Get the output sample rate.
    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Feed interleaved input; returns whatever interleaved output is ready.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        for frame in input.chunks_exact(self.channels) {
            for (channel, sample) in self.pending.iter_mut().zip(frame) {
                channel.push(*sample);
            }
            self.consumed += 1;
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= CHUNK_SIZE {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_SIZE).collect())
                .collect();
            self.run_chunk(&chunk, usize::MAX, &mut output)?;
        }
        Ok(output)
    }

    /// Drain the remaining input at end of stream.
    ///
    /// Zero chunks are pushed through until the delayed tail has come out,
    /// and the output is cut at the length the input rate implies.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut output = Vec::new();
        if self.consumed == 0 {
            return Ok(output);
        }

        let target = self.expected_output();
        while self.produced < target {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| {
                    let mut data = std::mem::take(ch);
                    data.resize(CHUNK_SIZE, 0.0);
                    data
                })
                .collect();
            let limit = usize::try_from(target - self.produced).unwrap_or(usize::MAX);
            if self.run_chunk(&chunk, limit, &mut output)? == 0 && self.skip == 0 {
                break;
            }
        }
        self.consumed = 0;
        self.produced = 0;
        Ok(output)
    }

    /// Output frames that `consumed` input frames should turn into.
    fn expected_output(&self) -> u64 {
        (u128::from(self.consumed) * u128::from(self.output_rate))
            .div_ceil(u128::from(self.input_rate))
            .try_into()
            .unwrap_or(u64::MAX)
    }

    /// Forget buffered input and filter history (after a seek).
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.iter_mut().for_each(Vec::clear);
        self.skip = self.resampler.output_delay();
        self.consumed = 0;
        self.produced = 0;
    }

    /// Resample one chunk, dropping any outstanding delay and keeping at most
    /// `keep` frames. Returns the number of frames appended.
    fn run_chunk(
        &mut self,
        chunk: &[Vec<f32>],
        keep: usize,
        output: &mut Vec<f32>,
    ) -> Result<usize> {
        let resampled = self
            .resampler
            .process(chunk, None)
            .map_err(|e| Error::Decode(format!("resample failed: {e}")))?;

        let available = resampled.first().map_or(0, Vec::len);
        let start = self.skip.min(available);
        self.skip -= start;
        let end = available.min(start.saturating_add(keep));
        output.reserve((end - start) * self.channels);
        for frame in start..end {
            for channel in &resampled {
                output.push(channel[frame]);
            }
        }
        self.produced += (end - start) as u64;
        Ok(end - start)
    }
}
