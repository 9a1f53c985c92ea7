//! Audio source identifiers and track metadata.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::{Error, Result};

/// Where a track's audio comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackSource {
    /// A file on the local filesystem.
    File(PathBuf),
    /// A remote HTTP(S) stream. Never seekable.
    Stream(Url),
    /// A generated sine tone, used for calibration and tests.
    Tone {
        frequency_hz: f32,
        duration: Duration,
    },
}

impl TrackSource {
    /// Parse a user-supplied location: `http(s)://` URLs become streams,
    /// `tone:<hz>:<seconds>` becomes a generated tone, anything else a file path.
    pub fn parse(location: &str) -> Result<Self> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let url = Url::parse(location)
                .map_err(|e| Error::InvalidArgument(format!("invalid stream URL: {e}")))?;
            return Ok(Self::Stream(url));
        }

        if let Some(spec) = location.strip_prefix("tone:") {
            let (freq, secs) = spec.split_once(':').ok_or_else(|| {
                Error::InvalidArgument(format!("expected tone:<hz>:<seconds>, got {location}"))
            })?;
            let frequency_hz: f32 = freq
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid tone frequency: {freq}")))?;
            let seconds: f64 = secs
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid tone duration: {secs}")))?;
            if frequency_hz <= 0.0 || !seconds.is_finite() || seconds <= 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "tone parameters out of range: {location}"
                )));
            }
            return Ok(Self::Tone {
                frequency_hz,
                duration: Duration::from_secs_f64(seconds),
            });
        }

        Ok(Self::File(PathBuf::from(location)))
    }

    /// True for live network sources.
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// File extension, used as a format hint.
    pub fn extension(&self) -> Option<String> {
        match self {
            Self::File(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase),
            Self::Stream(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|name| name.rsplit_once('.'))
                .map(|(_, ext)| ext.to_ascii_lowercase()),
            Self::Tone { .. } => None,
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Stream(url) => write!(f, "{url}"),
            Self::Tone {
                frequency_hz,
                duration,
            } => write!(f, "tone {frequency_hz} Hz for {duration:?}"),
        }
    }
}

/// Loudness metadata used for normalization.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackLoudness {
    /// ReplayGain track gain in dB (relative to the -18 LUFS reference).
    pub replay_gain_db: Option<f64>,
    /// Track sample peak, linear (1.0 = full scale).
    pub peak: Option<f64>,
    /// Measured integrated loudness in LUFS, when known.
    pub integrated_lufs: Option<f64>,
}

impl TrackLoudness {
    /// True if there is anything to normalize against.
    pub const fn is_known(&self) -> bool {
        self.replay_gain_db.is_some() || self.integrated_lufs.is_some()
    }
}

/// Read-only snapshot of a loaded track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub source: TrackSource,
    /// Total duration, if the container reports one.
    pub duration: Option<Duration>,
    /// Whether the decoder can seek.
    pub seekable: bool,
    /// Native sample rate before conversion.
    pub source_sample_rate: u32,
    /// Native channel count before conversion.
    pub source_channels: u16,
    pub loudness: TrackLoudness,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_parse_stream() {
        let source = TrackSource::parse("https://radio.example.com/live/stream.mp3").unwrap();
        assert!(source.is_stream());
        assert_eq!(source.extension().as_deref(), Some("mp3"));
    }

    #[test]
    fn test_parse_file() {
        let source = TrackSource::parse("/music/Album/01 Intro.FLAC").unwrap();
        assert_eq!(source, TrackSource::File(PathBuf::from("/music/Album/01 Intro.FLAC")));
        assert_eq!(source.extension().as_deref(), Some("flac"));
    }

    #[test]
    fn test_parse_tone() {
        let source = TrackSource::parse("tone:440:2.5").unwrap();
        assert_eq!(
            source,
            TrackSource::Tone {
                frequency_hz: 440.0,
                duration: Duration::from_millis(2500),
            }
        );
        assert!(TrackSource::parse("tone:440").is_err());
        assert!(TrackSource::parse("tone:-1:2").is_err());
    }
}
