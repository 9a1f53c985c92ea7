//! # harmony-audio
//!
//! Two-deck playback engine for Harmony.
//!
//! Features:
//! - Pluggable decoding (symphonia for files and HTTP streams, a tone generator)
//! - Per-deck DSP: 10-band equalizer, loudness normalization, master volume
//! - Crossfading between decks with equal-power, linear or S-curve weights
//! - Lock-free hand-off to a cpal output callback that never blocks

pub mod adapter;
pub mod buffer;
pub mod command;
pub mod decode;
pub mod dsp;
pub mod engine;
pub mod mixer;
pub mod output;
pub mod pipeline;
pub mod resample;
pub mod scheduler;
pub mod tone;

pub use adapter::{DecodeBackend, DecodedStream, DecoderAdapter, SourceRouter, TrackHandle};
pub use decode::SymphoniaBackend;
pub use engine::{AudioEngine, EngineEvent};
pub use mixer::{CrossfadeMixer, MixerState};
pub use output::{list_output_devices, OfflineOutput};
pub use scheduler::PlaybackScheduler;
pub use tone::ToneBackend;
