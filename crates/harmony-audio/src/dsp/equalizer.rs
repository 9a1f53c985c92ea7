//! 10-band graphic equalizer.
//!
//! Each band is an RBJ-cookbook peaking biquad at an ISO octave frequency.
//! Gain changes ramp in dB: the band gain moves a fixed step every
//! [`COEFF_UPDATE_INTERVAL`] samples and the coefficients are recomputed at
//! each step, so a change never jumps the filter response.

use std::f32::consts::PI;
use std::time::Duration;

use harmony_core::{FrameFormat, EQ_BAND_COUNT, EQ_BAND_FREQUENCIES, EQ_MAX_GAIN_DB, EQ_MIN_GAIN_DB};

/// Band quality factor. One octave wide.
pub const EQ_Q: f32 = 1.41;

/// Samples between coefficient recomputations while a band is ramping.
pub const COEFF_UPDATE_INTERVAL: usize = 16;

/// Normalized biquad coefficients (`a0` divided out).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    fn peaking(frequency: f32, gain_db: f32, sample_rate: f32) -> Self {
        if gain_db.abs() < 1e-4 {
            return Self::IDENTITY;
        }

        let a = 10.0_f32.powf(gain_db / 40.0);
        // Keep the center well below Nyquist at low sample rates.
        let frequency = frequency.min(sample_rate * 0.45);
        let omega = 2.0 * PI * frequency / sample_rate;
        let (sin_omega, cos_omega) = omega.sin_cos();
        let alpha = sin_omega / (2.0 * EQ_Q);

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_omega) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_omega) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }
}

/// Direct form I history for one channel.
#[derive(Debug, Clone, Copy, Default)]
struct History {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl History {
    #[inline]
    fn process(&mut self, c: &Coefficients, x: f32) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

#[derive(Debug, Clone)]
struct Band {
    frequency: f32,
    current_db: f32,
    target_db: f32,
    /// dB moved per coefficient update while ramping.
    step_db: f32,
    /// Coefficient updates left in the current ramp.
    remaining: u32,
    coefficients: Coefficients,
    history: Vec<History>,
}

impl Band {
    fn advance(&mut self, sample_rate: f32) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        self.current_db = if self.remaining == 0 {
            self.target_db
        } else {
            self.current_db + self.step_db
        };
        self.coefficients = Coefficients::peaking(self.frequency, self.current_db, sample_rate);
    }
}

/// Per-deck equalizer with owned filter history.
#[derive(Debug, Clone)]
pub struct Equalizer {
    bands: Vec<Band>,
    sample_rate: f32,
    channels: usize,
    /// Coefficient updates a full ramp takes.
    ramp_updates: u32,
    /// Samples until the next coefficient update.
    countdown: usize,
}

impl Equalizer {
    /// Create an equalizer starting at `gains` (no ramp).
    pub fn new(format: FrameFormat, gains: &[f32; EQ_BAND_COUNT], ramp: Duration) -> Self {
        let sample_rate = format.sample_rate as f32;
        let channels = usize::from(format.channels);
        let ramp_samples = format.duration_to_samples(ramp) as usize;
        let ramp_updates = ramp_samples.div_ceil(COEFF_UPDATE_INTERVAL).max(1) as u32;

        let bands = EQ_BAND_FREQUENCIES
            .iter()
            .zip(gains)
            .map(|(&frequency, &gain)| {
                let gain = clamp_gain(gain);
                Band {
                    frequency,
                    current_db: gain,
                    target_db: gain,
                    step_db: 0.0,
                    remaining: 0,
                    coefficients: Coefficients::peaking(frequency, gain, sample_rate),
                    history: vec![History::default(); channels],
                }
            })
            .collect();

        Self {
            bands,
            sample_rate,
            channels,
            ramp_updates,
            countdown: 0,
        }
    }

    /// Ramp band `index` to `gain_db` (clamped to ±12 dB). Out-of-range
    /// indices are ignored.
    pub fn set_band_gain(&mut self, index: usize, gain_db: f32) {
        let ramp_updates = self.ramp_updates as f32;
        if let Some(band) = self.bands.get_mut(index) {
            band.target_db = clamp_gain(gain_db);
            band.step_db = (band.target_db - band.current_db) / ramp_updates;
            band.remaining = self.ramp_updates;
        }
    }

    /// Ramp every band to `gains`.
    pub fn set_gains(&mut self, gains: &[f32; EQ_BAND_COUNT]) {
        for (index, gain) in gains.iter().enumerate() {
            self.set_band_gain(index, *gain);
        }
    }

    /// Gain currently applied by band `index`.
    pub fn band_gain(&self, index: usize) -> Option<f32> {
        self.bands.get(index).map(|b| b.current_db)
    }

    /// Gain band `index` is ramping toward.
    pub fn target_gain(&self, index: usize) -> Option<f32> {
        self.bands.get(index).map(|b| b.target_db)
    }

    /// Coefficient updates one ramp is spread over.
    pub const fn ramp_updates(&self) -> u32 {
        self.ramp_updates
    }

    pub fn is_ramping(&self) -> bool {
        self.bands.iter().any(|b| b.remaining > 0)
    }

    /// Clear filter history and finish any ramp. Used on track load.
    pub fn reset(&mut self) {
        for band in &mut self.bands {
            band.history.fill(History::default());
            if band.remaining > 0 {
                band.remaining = 0;
                band.current_db = band.target_db;
                band.coefficients =
                    Coefficients::peaking(band.frequency, band.current_db, self.sample_rate);
            }
        }
        self.countdown = 0;
    }

    /// Filter one frame of interleaved samples in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        for frame in samples.chunks_exact_mut(self.channels) {
            if self.countdown == 0 {
                for band in &mut self.bands {
                    band.advance(self.sample_rate);
                }
                self.countdown = COEFF_UPDATE_INTERVAL;
            }
            self.countdown -= 1;

            for band in &mut self.bands {
                let coefficients = band.coefficients;
                for (sample, history) in frame.iter_mut().zip(band.history.iter_mut()) {
                    *sample = history.process(&coefficients, *sample);
                }
            }
        }
    }
}

fn clamp_gain(gain_db: f32) -> f32 {
    if gain_db.is_finite() {
        gain_db.clamp(EQ_MIN_GAIN_DB, EQ_MAX_GAIN_DB)
    } else {
        0.0
    }
}
