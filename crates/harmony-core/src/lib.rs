//! # harmony-core
//!
//! Core types, settings, and error handling for the Harmony playback engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
