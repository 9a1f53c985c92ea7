//! Crossfade mixer.
//!
//! Outside a transition the active deck passes through untouched. During a
//! fade the outgoing and incoming decks are blended sample by sample with
//! weights from the configured [`FadeCurve`].

use std::f32::consts::FRAC_PI_2;

use harmony_core::FadeCurve;

/// Fade-in gain for normalized position `x` in `[0, 1]`.
#[inline]
fn curve_gain(curve: FadeCurve, x: f32) -> f32 {
    match curve {
        FadeCurve::Linear => x,
        FadeCurve::EqualPower => (x * FRAC_PI_2).sin(),
        FadeCurve::SCurve => (1.0 - (std::f32::consts::PI * x).cos()) * 0.5,
    }
}

/// `(outgoing, incoming)` weights at fade progress `t`.
///
/// Both ends are exact: `t <= 0` gives `(1, 0)` and `t >= 1` gives `(0, 1)`.
#[inline]
pub fn fade_weights(curve: FadeCurve, t: f32) -> (f32, f32) {
    if t.is_nan() || t <= 0.0 {
        return (1.0, 0.0);
    }
    if t >= 1.0 {
        return (0.0, 1.0);
    }
    (curve_gain(curve, 1.0 - t), curve_gain(curve, t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    PassThrough,
    /// Positions are per-channel samples.
    Fading { elapsed: u64, total: u64 },
}

/// Blends two decks during a transition.
#[derive(Debug, Clone)]
pub struct CrossfadeMixer {
    state: MixerState,
    curve: FadeCurve,
    channels: usize,
}

impl CrossfadeMixer {
    pub const fn new(curve: FadeCurve, channels: usize) -> Self {
        Self {
            state: MixerState::PassThrough,
            curve,
            channels,
        }
    }

    pub const fn state(&self) -> MixerState {
        self.state
    }

    pub const fn is_fading(&self) -> bool {
        matches!(self.state, MixerState::Fading { .. })
    }

    pub fn set_curve(&mut self, curve: FadeCurve) {
        self.curve = curve;
    }

    /// Begin a fade lasting `total` samples. A zero-length fade is refused
    /// (the caller cuts instead).
    pub fn start(&mut self, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        self.state = MixerState::Fading { elapsed: 0, total };
        true
    }

    /// End the fade now with the incoming deck fully up. Used when the
    /// outgoing deck runs out before the fade does.
    pub fn finish(&mut self) {
        self.state = MixerState::PassThrough;
    }

    /// Weights that will apply to the next sample.
    pub fn weights(&self) -> (f32, f32) {
        match self.state {
            MixerState::PassThrough => (0.0, 1.0),
            MixerState::Fading { elapsed, total } => {
                fade_weights(self.curve, (elapsed + 1) as f32 / total as f32)
            }
        }
    }

    /// Mix `incoming` into `outgoing` in place. Returns true if the fade
    /// completed within this block; the remainder of the block is then pure
    /// incoming audio.
    pub fn mix(&mut self, outgoing: &mut [f32], incoming: &[f32]) -> bool {
        let MixerState::Fading { mut elapsed, total } = self.state else {
            outgoing.copy_from_slice(incoming);
            return false;
        };

        let channels = self.channels;
        for (out, inc) in outgoing
            .chunks_exact_mut(channels)
            .zip(incoming.chunks_exact(channels))
        {
            elapsed = (elapsed + 1).min(total);
            let (w_out, w_in) = fade_weights(self.curve, elapsed as f32 / total as f32);
            for (o, i) in out.iter_mut().zip(inc) {
                *o = *o * w_out + *i * w_in;
            }
        }

        if elapsed >= total {
            self.state = MixerState::PassThrough;
            true
        } else {
            self.state = MixerState::Fading { elapsed, total };
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_weights_are_exact_at_ends() {
        for curve in [FadeCurve::Linear, FadeCurve::EqualPower, FadeCurve::SCurve] {
            assert_eq!(fade_weights(curve, 0.0), (1.0, 0.0));
            assert_eq!(fade_weights(curve, 1.0), (0.0, 1.0));
            assert_eq!(fade_weights(curve, 1.5), (0.0, 1.0));
        }
    }

    #[test]
    fn test_equal_power_keeps_power() {
        for step in 1..10 {
            let (a, b) = fade_weights(FadeCurve::EqualPower, step as f32 / 10.0);
            assert!((a * a + b * b - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_linear_midpoint() {
        let (a, b) = fade_weights(FadeCurve::Linear, 0.5);
        assert!((a - 0.5).abs() < 1e-6 && (b - 0.5).abs() < 1e-6);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_fade_completes_after_total_samples() {
        let mut mixer = CrossfadeMixer::new(FadeCurve::EqualPower, 2);
        assert!(mixer.start(8));

        let mut out = [1.0f32; 8];
        let inc = [0.0f32; 8];
        assert!(!mixer.mix(&mut out, &inc));
        assert!(out[0] > out[6]);

        let mut out = [1.0f32; 8];
        assert!(mixer.mix(&mut out, &inc));
        // The last sample of the fade has the outgoing deck fully down.
        assert_eq!(out[6], 0.0);
        assert_eq!(mixer.state(), MixerState::PassThrough);
        assert_eq!(mixer.weights(), (0.0, 1.0));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_passthrough_copies_incoming() {
        let mut mixer = CrossfadeMixer::new(FadeCurve::Linear, 1);
        assert!(!mixer.start(0));
        let mut out = [0.3f32; 4];
        assert!(!mixer.mix(&mut out, &[0.7; 4]));
        assert_eq!(out, [0.7; 4]);
    }
}
