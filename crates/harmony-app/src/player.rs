//! Drives the engine through a queue of tracks and reports what happens.

use std::time::Duration;

use anyhow::{Context, Result};
use harmony_audio::{AudioEngine, EngineEvent};
use harmony_core::{DeckSelector, PlaybackState, TrackSource};
use tracing::{error, info, warn};

/// How often the progress line is refreshed while nothing else happens.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one event as far as the player loop is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

/// Plays `sources` in order and returns once the queue has run out.
pub fn play_queue(engine: &AudioEngine, sources: Vec<TrackSource>) -> Result<()> {
    let mut sources = sources.into_iter();
    let Some(first) = sources.next() else {
        return Ok(());
    };

    let info = engine
        .load(DeckSelector::Active, first)
        .context("Failed to load first track")?;
    info!("Now playing: {}", info.source);

    for source in sources {
        engine.enqueue(source)?;
    }
    engine.play()?;

    let mut started = false;
    loop {
        match engine.recv_event_timeout(PROGRESS_INTERVAL) {
            Some(event) => {
                if matches!(event, EngineEvent::StateChanged(PlaybackState::Playing)) {
                    started = true;
                }
                if handle_event(&event, started) == Flow::Done {
                    break;
                }
            }
            None => {
                if engine.state().is_audible() {
                    println!("{}", progress_line(engine.position(), engine.duration()));
                }
            }
        }
    }

    let underruns = engine.underruns();
    if underruns > 0 {
        warn!("{underruns} buffer underruns during playback");
    }
    Ok(())
}

fn handle_event(event: &EngineEvent, started: bool) -> Flow {
    match event {
        EngineEvent::StateChanged(state) => {
            info!("State: {state}");
            if started && matches!(state, PlaybackState::Stopped | PlaybackState::Idle) {
                return Flow::Done;
            }
        }
        EngineEvent::TrackLoaded { deck, info } => {
            let length = info
                .duration
                .map_or_else(|| "live".to_string(), format_time);
            info!("Deck {deck}: {} ({length})", info.source);
        }
        EngineEvent::LoadFailed {
            deck,
            source,
            error,
        } => warn!("Deck {deck}: could not load {source}: {error}"),
        EngineEvent::ActiveDeckChanged(deck) => info!("Active deck: {deck}"),
        EngineEvent::TrackFinished(deck) => info!("Deck {deck} finished"),
        EngineEvent::CrossfadeStarted { from, to, duration } => {
            info!("Crossfading {from} -> {to} over {}", format_time(*duration));
        }
        EngineEvent::CrossfadeFinished(deck) => info!("Crossfade complete, deck {deck} playing"),
        EngineEvent::NothingToSkipTo => info!("Nothing queued"),
        EngineEvent::DecodeError { deck, error } => {
            error!("Deck {deck}: decode error, skipping: {error}");
        }
        EngineEvent::DeviceError(message) => {
            error!("Output device failed: {message}");
            return Flow::Done;
        }
        EngineEvent::Fault => {
            error!("Playback faulted after repeated underruns");
            return Flow::Done;
        }
    }
    Flow::Continue
}

fn format_time(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn progress_line(position: Duration, duration: Option<Duration>) -> String {
    match duration {
        Some(total) => format!("  {} / {}", format_time(position), format_time(total)),
        None => format!("  {}", format_time(position)),
    }
}
