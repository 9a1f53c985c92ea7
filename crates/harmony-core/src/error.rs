//! Error types for Harmony.

use std::time::Duration;

use thiserror::Error;

use crate::types::DeckId;

/// Result type alias using Harmony's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Harmony.
#[derive(Error, Debug)]
pub enum Error {
    // Source errors
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    // Seek errors
    #[error("Seeking is not supported by this source")]
    SeekUnsupported,

    #[error("Seek position {requested:?} is beyond track duration {duration:?}")]
    SeekOutOfBounds {
        requested: Duration,
        duration: Duration,
    },

    // Real-time errors
    #[error("Buffer underrun on deck {0}")]
    BufferUnderrun(DeckId),

    #[error("Audio device error: {0}")]
    Device(String),

    // Control errors
    #[error("No track loaded")]
    NoTrackLoaded,

    #[error("Command queue is full")]
    CommandQueueFull,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Audio engine has shut down")]
    EngineShutdown,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if playback can continue after this error without user action.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::BufferUnderrun(_) | Self::SeekUnsupported | Self::Cancelled
        )
    }

    /// Returns true if this error should end the current track early
    /// instead of halting playback.
    pub const fn ends_track(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Returns true if this error terminates the output session.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Decode("bad packet".into()).is_recoverable());
        assert!(Error::Decode("bad packet".into()).ends_track());
        assert!(Error::BufferUnderrun(DeckId::A).is_recoverable());
        assert!(!Error::BufferUnderrun(DeckId::A).ends_track());
        assert!(Error::Device("unplugged".into()).is_fatal());
        assert!(!Error::SourceUnavailable("missing".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::SeekOutOfBounds {
            requested: Duration::from_secs(12),
            duration: Duration::from_secs(10),
        };
        assert_eq!(
            err.to_string(),
            "Seek position 12s is beyond track duration 10s"
        );
        assert_eq!(
            Error::SeekUnsupported.to_string(),
            "Seeking is not supported by this source"
        );
    }
}
