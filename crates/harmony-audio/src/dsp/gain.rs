//! Gain stages: smoothed linear gain and loudness normalization.

use harmony_core::{NormalizationSettings, TrackLoudness};

/// Loudness ReplayGain values are referenced to.
pub const REPLAYGAIN_REFERENCE_LUFS: f64 = -18.0;

/// Largest normalization boost or cut.
pub const MAX_NORMALIZATION_DB: f64 = 12.0;

pub fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

pub fn linear_to_db(linear: f64) -> f64 {
    if linear <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * linear.log10()
    }
}

/// Gain in dB that brings a track to the configured loudness target.
///
/// ReplayGain tags win over a measured loudness; with neither, the fallback
/// gain is used. The result is clamped to ±12 dB and, with clipping
/// prevention on, limited so the tagged peak stays at or below full scale.
pub fn normalization_gain_db(loudness: &TrackLoudness, settings: &NormalizationSettings) -> f64 {
    if !settings.enabled {
        return 0.0;
    }

    let gain = if let Some(replay_gain) = loudness.replay_gain_db {
        replay_gain + (settings.target_lufs - REPLAYGAIN_REFERENCE_LUFS)
    } else if let Some(lufs) = loudness.integrated_lufs {
        settings.target_lufs - lufs
    } else {
        settings.fallback_gain_db
    };

    let mut gain = gain.clamp(-MAX_NORMALIZATION_DB, MAX_NORMALIZATION_DB);

    if settings.prevent_clipping {
        if let Some(peak) = loudness.peak.filter(|p| *p > 0.0) {
            gain = gain.min(-linear_to_db(peak));
        }
    }

    gain
}

/// Linear gain that ramps to new targets instead of jumping.
#[derive(Debug, Clone)]
pub struct SmoothedGain {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
    ramp_samples: u32,
}

impl SmoothedGain {
    /// `ramp_samples` is the per-channel sample count one change takes.
    pub fn new(initial: f32, ramp_samples: u32) -> Self {
        Self {
            current: initial,
            target: initial,
            step: 0.0,
            remaining: 0,
            ramp_samples: ramp_samples.max(1),
        }
    }

    pub const fn current(&self) -> f32 {
        self.current
    }

    pub const fn target(&self) -> f32 {
        self.target
    }

    pub const fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Largest change between two consecutive samples during a ramp from
    /// `from` to `to`.
    pub fn max_step(&self, from: f32, to: f32) -> f32 {
        (to - from).abs() / self.ramp_samples as f32
    }

    /// Ramp to `target` linearly.
    pub fn set_target(&mut self, target: f32) {
        if target == self.target && self.remaining == 0 {
            return;
        }
        self.target = target;
        self.remaining = self.ramp_samples;
        self.step = (target - self.current) / self.ramp_samples as f32;
    }

    /// Jump to `value` with no ramp.
    pub fn set_immediate(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.step = 0.0;
        self.remaining = 0;
    }

    /// Gain for the next sample frame.
    #[inline]
    pub fn next_gain(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }

    /// Multiply interleaved `samples` in place, one gain step per sample frame.
    pub fn apply(&mut self, samples: &mut [f32], channels: usize) {
        if self.remaining == 0 {
            let gain = self.current;
            #[allow(clippy::float_cmp)]
            if gain != 1.0 {
                samples.iter_mut().for_each(|s| *s *= gain);
            }
            return;
        }

        for frame in samples.chunks_exact_mut(channels) {
            let gain = self.next_gain();
            frame.iter_mut().for_each(|s| *s *= gain);
        }
    }
}
