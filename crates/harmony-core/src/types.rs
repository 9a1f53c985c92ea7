//! Core domain types for Harmony.

pub mod deck;
pub mod frame;
pub mod settings;
pub mod source;
pub mod state;

pub use deck::{DeckId, DeckSelector};
pub use frame::{Frame, FrameFormat};
pub use settings::{
    BufferSettings, CrossfadeSettings, EngineSettings, EqPreset, FadeCurve,
    NormalizationSettings, EQ_BAND_COUNT, EQ_BAND_FREQUENCIES, EQ_MAX_GAIN_DB, EQ_MIN_GAIN_DB,
    MAX_CROSSFADE_MS,
};
pub use source::{TrackInfo, TrackLoudness, TrackSource};
pub use state::{PlaybackState, Transition};
