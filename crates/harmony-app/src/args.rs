//! Command-line arguments and settings resolution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use harmony_core::{EngineSettings, EqPreset, FadeCurve, TrackSource};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "harmony")]
#[command(about = "Play local files and streams through the Harmony engine")]
#[command(version)]
pub struct Args {
    /// Files, `http(s)://` URLs, or `tone:<hz>:<seconds>`
    #[arg(required_unless_present = "list_devices")]
    pub sources: Vec<String>,

    /// Settings file (JSON). Defaults to the per-user config directory.
    #[arg(short, long, env = "HARMONY_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Output device name
    #[arg(short, long, env = "HARMONY_DEVICE")]
    pub device: Option<String>,

    /// Master volume, 0.0 to 1.0
    #[arg(long)]
    pub volume: Option<f32>,

    /// Equalizer preset (flat, bass-boost, treble-boost, v-shape, vocal, ...)
    #[arg(long, value_parser = parse_preset)]
    pub eq_preset: Option<EqPreset>,

    /// Crossfade length in milliseconds; 0 disables crossfading
    #[arg(long)]
    pub crossfade_ms: Option<u32>,

    /// Crossfade curve: linear, equal-power or s-curve
    #[arg(long, value_parser = parse_curve)]
    pub fade_curve: Option<FadeCurve>,

    /// Print the effective settings as JSON and exit
    #[arg(long)]
    pub print_settings: bool,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

fn parse_preset(name: &str) -> Result<EqPreset, String> {
    EqPreset::from_name(name).ok_or_else(|| format!("unknown EQ preset: {name}"))
}

fn parse_curve(name: &str) -> Result<FadeCurve, String> {
    match name.to_ascii_lowercase().replace('_', "-").as_str() {
        "linear" => Ok(FadeCurve::Linear),
        "equal-power" | "equalpower" => Ok(FadeCurve::EqualPower),
        "s-curve" | "scurve" => Ok(FadeCurve::SCurve),
        _ => Err(format!("unknown fade curve: {name}")),
    }
}

/// Default settings location, e.g. `~/.config/harmony/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "harmony").map(|d| d.config_dir().join("settings.json"))
}

impl Args {
    /// Load the settings file (if any) and apply command-line overrides.
    ///
    /// An explicitly named file must exist; the default one is optional.
    pub fn settings(&self) -> Result<EngineSettings> {
        let mut settings = match (&self.settings, default_settings_path()) {
            (Some(path), _) => load_settings(path)?,
            (None, Some(path)) if path.exists() => load_settings(&path)?,
            _ => {
                debug!("No settings file, using defaults");
                EngineSettings::default()
            }
        };

        if let Some(volume) = self.volume {
            settings.volume = volume;
        }
        if let Some(preset) = self.eq_preset {
            settings = settings.with_eq_preset(preset);
        }
        if let Some(duration_ms) = self.crossfade_ms {
            settings.crossfade.enabled = duration_ms > 0;
            settings.crossfade.duration_ms = duration_ms;
        }
        if let Some(curve) = self.fade_curve {
            settings.crossfade.curve = curve;
        }

        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }

    pub fn track_sources(&self) -> Result<Vec<TrackSource>> {
        self.sources
            .iter()
            .map(|s| TrackSource::parse(s).with_context(|| format!("Bad source: {s}")))
            .collect()
    }
}

fn load_settings(path: &Path) -> Result<EngineSettings> {
    info!("Loading settings from {}", path.display());
    EngineSettings::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("harmony").chain(args.iter().copied())).unwrap()
    }

    fn temp_settings(name: &str, json: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("harmony-{}-{name}.json", std::process::id()));
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_sources_required_unless_listing() {
        assert!(Args::try_parse_from(["harmony"]).is_err());
        assert!(parse(&["--list-devices"]).list_devices);
    }

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let path = temp_settings("overrides", r#"{ "volume": 0.5 }"#);
        let args = parse(&[
            "a.flac",
            "--settings",
            path.to_str().unwrap(),
            "--eq-preset",
            "bass boost",
            "--crossfade-ms",
            "4000",
            "--fade-curve",
            "s-curve",
        ]);
        let settings = args.settings().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!((settings.volume - 0.5).abs() < f32::EPSILON);
        assert_eq!(settings.eq_gains_db, EqPreset::BassBoost.gains());
        assert!(settings.crossfade.enabled);
        assert_eq!(settings.crossfade.duration_ms, 4_000);
        assert_eq!(settings.crossfade.curve, FadeCurve::SCurve);
    }

    #[test]
    fn test_zero_crossfade_disables() {
        let path = temp_settings("zero", "{}");
        let args = parse(&["a.flac", "-s", path.to_str().unwrap(), "--crossfade-ms", "0"]);
        let settings = args.settings().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(!settings.crossfade.enabled);
    }

    #[test]
    fn test_out_of_range_override_is_rejected() {
        let path = temp_settings("range", "{}");
        let args = parse(&["a.flac", "-s", path.to_str().unwrap(), "--volume", "1.5"]);
        let result = args.settings();
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let args = parse(&["a.flac", "--settings", "/nonexistent/harmony.json"]);
        assert!(args.settings().is_err());
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!(Args::try_parse_from(["harmony", "a.flac", "--eq-preset", "loud"]).is_err());
        assert!(Args::try_parse_from(["harmony", "a.flac", "--fade-curve", "cubic"]).is_err());
    }

    #[test]
    fn test_track_sources() {
        let args = parse(&["/music/a.flac", "https://example.com/b.mp3"]);
        let sources = args.track_sources().unwrap();
        assert_eq!(sources.len(), 2);
        assert!(sources[1].is_stream());
    }
}
