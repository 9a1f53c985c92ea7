//! Engine settings supplied by the host application at construction.
//!
//! The engine never persists these; the host loads them (typically from JSON)
//! and hands them over once.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of equalizer bands.
pub const EQ_BAND_COUNT: usize = 10;

/// ISO octave center frequencies (Hz) for the 10 bands.
pub const EQ_BAND_FREQUENCIES: [f32; EQ_BAND_COUNT] = [
    31.5, 63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// Lowest band gain in dB.
pub const EQ_MIN_GAIN_DB: f32 = -12.0;

/// Highest band gain in dB.
pub const EQ_MAX_GAIN_DB: f32 = 12.0;

/// Longest accepted crossfade.
pub const MAX_CROSSFADE_MS: u32 = 30_000;

/// Crossfade curve shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// Straight-line weights. Dips about 3 dB at the midpoint.
    Linear,
    /// Sine/cosine weights with constant summed power.
    #[default]
    EqualPower,
    /// Raised-cosine weights: slow start and end.
    SCurve,
}

/// Named equalizer curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqPreset {
    #[default]
    Flat,
    BassBoost,
    TrebleBoost,
    VShape,
    Vocal,
    Rock,
    Electronic,
    Acoustic,
}

impl EqPreset {
    /// Band gains in dB for this preset.
    pub const fn gains(self) -> [f32; EQ_BAND_COUNT] {
        match self {
            Self::Flat => [0.0; EQ_BAND_COUNT],
            Self::BassBoost => [6.0, 5.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            Self::TrebleBoost => [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 4.0, 5.0, 6.0],
            Self::VShape => [5.0, 4.0, 2.0, -1.0, -2.0, -2.0, -1.0, 2.0, 4.0, 5.0],
            Self::Vocal => [-2.0, -1.0, 0.0, 2.0, 4.0, 4.0, 2.0, 0.0, -1.0, -2.0],
            Self::Rock => [4.0, 3.0, 1.0, 0.0, -1.0, 0.0, 1.0, 3.0, 4.0, 4.0],
            Self::Electronic => [5.0, 4.0, 2.0, 0.0, 1.0, 2.0, 1.0, 3.0, 4.0, 4.0],
            Self::Acoustic => [2.0, 1.0, 0.0, 1.0, 2.0, 2.0, 1.0, 2.0, 2.0, 1.0],
        }
    }

    /// Parse a preset name as typed by a user (`"bass-boost"`, `"Bass Boost"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "flat" => Some(Self::Flat),
            "bassboost" | "bass" => Some(Self::BassBoost),
            "trebleboost" | "treble" => Some(Self::TrebleBoost),
            "vshape" => Some(Self::VShape),
            "vocal" => Some(Self::Vocal),
            "rock" => Some(Self::Rock),
            "electronic" => Some(Self::Electronic),
            "acoustic" => Some(Self::Acoustic),
            _ => None,
        }
    }
}

/// Crossfade behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossfadeSettings {
    pub enabled: bool,
    pub duration_ms: u32,
    pub curve: FadeCurve,
}

impl Default for CrossfadeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_ms: 5_000,
            curve: FadeCurve::EqualPower,
        }
    }
}

impl CrossfadeSettings {
    pub const fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms as u64)
    }
}

/// Loudness normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSettings {
    pub enabled: bool,
    /// Target integrated loudness in LUFS.
    pub target_lufs: f64,
    /// Gain applied when a track carries no loudness metadata.
    pub fallback_gain_db: f64,
    /// Limit the gain so the tagged peak never exceeds full scale.
    pub prevent_clipping: bool,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_lufs: -14.0,
            fallback_gain_db: 0.0,
            prevent_clipping: true,
        }
    }
}

/// Buffering and real-time tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Samples per channel in one frame.
    pub frame_len: usize,
    /// Pre-decoded audio held per deck.
    pub buffer_ms: u32,
    /// Ramp length for gain and EQ changes.
    pub ramp_ms: u32,
    /// Consecutive underrun frames tolerated before the engine faults.
    pub max_consecutive_underruns: u32,
    /// Fade the frame in which pause/resume is applied.
    pub fade_on_pause: bool,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            frame_len: 480,
            buffer_ms: 400,
            ramp_ms: 10,
            max_consecutive_underruns: 500,
            fade_on_pause: true,
        }
    }
}

impl BufferSettings {
    pub const fn buffer(&self) -> Duration {
        Duration::from_millis(self.buffer_ms as u64)
    }

    pub const fn ramp(&self) -> Duration {
        Duration::from_millis(self.ramp_ms as u64)
    }
}

/// Everything the engine needs from persisted user preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Master volume, 0.0 to 1.0.
    pub volume: f32,
    /// Equalizer band gains in dB.
    pub eq_gains_db: [f32; EQ_BAND_COUNT],
    pub crossfade: CrossfadeSettings,
    pub normalization: NormalizationSettings,
    pub buffer: BufferSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            volume: 0.85,
            eq_gains_db: [0.0; EQ_BAND_COUNT],
            crossfade: CrossfadeSettings::default(),
            normalization: NormalizationSettings::default(),
            buffer: BufferSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Read settings from a JSON file and validate them.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check ranges. Out-of-range values are errors, not silently clamped,
    /// so a corrupt settings file is noticed.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::InvalidArgument(format!(
                "volume {} outside 0.0..=1.0",
                self.volume
            )));
        }

        for (index, gain) in self.eq_gains_db.iter().enumerate() {
            if !(EQ_MIN_GAIN_DB..=EQ_MAX_GAIN_DB).contains(gain) {
                return Err(Error::InvalidArgument(format!(
                    "EQ band {index} gain {gain} dB outside {EQ_MIN_GAIN_DB}..={EQ_MAX_GAIN_DB}"
                )));
            }
        }

        if self.crossfade.duration_ms > MAX_CROSSFADE_MS {
            return Err(Error::InvalidArgument(format!(
                "crossfade duration {} ms exceeds {MAX_CROSSFADE_MS} ms",
                self.crossfade.duration_ms
            )));
        }

        if !self.normalization.target_lufs.is_finite()
            || !(-70.0..=0.0).contains(&self.normalization.target_lufs)
        {
            return Err(Error::InvalidArgument(format!(
                "normalization target {} LUFS out of range",
                self.normalization.target_lufs
            )));
        }

        let buffer = &self.buffer;
        if buffer.frame_len == 0 || buffer.frame_len > 8192 {
            return Err(Error::InvalidArgument(format!(
                "frame length {} out of range",
                buffer.frame_len
            )));
        }
        if buffer.buffer_ms < 20 {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} ms is too small",
                buffer.buffer_ms
            )));
        }

        Ok(())
    }

    /// Apply a preset to the band gains.
    pub fn with_eq_preset(mut self, preset: EqPreset) -> Self {
        self.eq_gains_db = preset.gains();
        self
    }
}
