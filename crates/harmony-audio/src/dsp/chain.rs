use harmony_core::{EngineSettings, Frame, FrameFormat, EQ_BAND_COUNT};

use super::equalizer::Equalizer;
use super::gain::{db_to_linear, SmoothedGain};

/// Per-deck processing: equalizer, then normalization gain, then master volume.
///
/// Each deck owns one chain, so filter history is never shared between the
/// outgoing and incoming track of a crossfade.
#[derive(Debug, Clone)]
pub struct DspChain {
    equalizer: Equalizer,
    normalization: SmoothedGain,
    volume: SmoothedGain,
    channels: usize,
}

impl DspChain {
    pub fn new(format: FrameFormat, settings: &EngineSettings) -> Self {
        let ramp = settings.buffer.ramp();
        let ramp_samples = format.duration_to_samples(ramp).max(1) as u32;
        Self {
            equalizer: Equalizer::new(format, &settings.eq_gains_db, ramp),
            normalization: SmoothedGain::new(1.0, ramp_samples),
            volume: SmoothedGain::new(settings.volume.clamp(0.0, 1.0), ramp_samples),
            channels: usize::from(format.channels),
        }
    }

    pub const fn equalizer(&self) -> &Equalizer {
        &self.equalizer
    }

    pub const fn volume(&self) -> &SmoothedGain {
        &self.volume
    }

    pub const fn normalization(&self) -> &SmoothedGain {
        &self.normalization
    }

    pub fn set_eq_band(&mut self, index: usize, gain_db: f32) {
        self.equalizer.set_band_gain(index, gain_db);
    }

    pub fn set_eq_gains(&mut self, gains: &[f32; EQ_BAND_COUNT]) {
        self.equalizer.set_gains(gains);
    }

    pub fn set_volume(&mut self, level: f32) {
        self.volume.set_target(level.clamp(0.0, 1.0));
    }

    /// Prepare for a new track: clear filter history and apply its
    /// normalization gain at once (the track starts from silence).
    pub fn reset_for_track(&mut self, normalization_db: f64) {
        self.equalizer.reset();
        self.normalization
            .set_immediate(db_to_linear(normalization_db) as f32);
    }

    /// Process one frame in place.
    pub fn process(&mut self, frame: &mut Frame) {
        let samples = frame.samples_mut();
        self.equalizer.process(samples);
        self.normalization.apply(samples, self.channels);
        self.volume.apply(samples, self.channels);
    }
}
