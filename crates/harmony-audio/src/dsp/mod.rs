//! Per-deck signal processing.

pub mod chain;
pub mod equalizer;
pub mod gain;

pub use chain::DspChain;
pub use equalizer::{Equalizer, COEFF_UPDATE_INTERVAL, EQ_Q};
pub use gain::{db_to_linear, linear_to_db, normalization_gain_db, SmoothedGain};
