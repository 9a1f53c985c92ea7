//! Facade-level tests: a live control worker feeding an offline renderer.
//!
//! The worker fills decks on its own thread, so each rendered frame is
//! followed by a short sleep to let it keep up.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity
#![allow(clippy::panic)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use harmony_audio::{
    AudioEngine, DecodeBackend, DecodedStream, EngineEvent, OfflineOutput, ToneBackend,
};
use harmony_core::{
    DeckId, DeckSelector, EngineSettings, Error, FrameFormat, PlaybackState, TrackLoudness,
    TrackSource,
};

const MAX_FRAMES: usize = 3_000;

/// Tones that take a while to open, like a slow network source.
struct SlowBackend {
    delay: Duration,
    tones: ToneBackend,
}

impl DecodeBackend for SlowBackend {
    fn open(&self, source: &TrackSource) -> harmony_core::Result<Box<dyn DecodedStream>> {
        thread::sleep(self.delay);
        self.tones.open(source)
    }
}

/// Tones whose decoding breaks after a fixed number of packets.
struct BrokenBackend {
    good_packets: usize,
    tones: ToneBackend,
}

impl DecodeBackend for BrokenBackend {
    fn open(&self, source: &TrackSource) -> harmony_core::Result<Box<dyn DecodedStream>> {
        Ok(Box::new(BrokenStream {
            inner: self.tones.open(source)?,
            remaining: self.good_packets,
        }))
    }
}

struct BrokenStream {
    inner: Box<dyn DecodedStream>,
    remaining: usize,
}

impl DecodedStream for BrokenStream {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn duration(&self) -> Option<Duration> {
        self.inner.duration()
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn loudness(&self) -> TrackLoudness {
        self.inner.loudness()
    }

    fn next_packet(&mut self) -> harmony_core::Result<Option<Vec<f32>>> {
        if self.remaining == 0 {
            return Err(Error::Decode("corrupt packet".to_string()));
        }
        self.remaining -= 1;
        self.inner.next_packet()
    }

    fn seek(&mut self, _position: Duration) -> harmony_core::Result<()> {
        Err(Error::Decode("not seekable".to_string()))
    }
}

fn settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.buffer.max_consecutive_underruns = 0;
    settings.normalization.enabled = false;
    settings
}

fn engine_with(
    settings: EngineSettings,
    backend: Arc<dyn DecodeBackend>,
) -> (AudioEngine, OfflineOutput) {
    let format = FrameFormat::new(8_000, 1, 80).unwrap();
    AudioEngine::offline(settings, format, backend).unwrap()
}

fn engine() -> (AudioEngine, OfflineOutput) {
    engine_with(settings(), Arc::new(ToneBackend::with_sample_rate(8_000)))
}

fn slow_engine(delay: Duration) -> (AudioEngine, OfflineOutput) {
    let mut settings = settings();
    settings.crossfade.enabled = false;
    settings.buffer.buffer_ms = 2_000;
    let backend = SlowBackend {
        delay,
        tones: ToneBackend::with_sample_rate(8_000),
    };
    engine_with(settings, Arc::new(backend))
}

fn tone(millis: u64) -> TrackSource {
    TrackSource::Tone {
        frequency_hz: 440.0,
        duration: Duration::from_millis(millis),
    }
}

/// Render frames until `done` holds, collecting engine events on the way.
fn pump_until(
    engine: &AudioEngine,
    output: &mut OfflineOutput,
    events: &mut Vec<EngineEvent>,
    mut done: impl FnMut(&AudioEngine, &[EngineEvent]) -> bool,
) {
    for _ in 0..MAX_FRAMES {
        output.render_frame();
        thread::sleep(Duration::from_millis(1));
        while let Some(event) = engine.try_recv_event() {
            events.push(event);
        }
        if done(engine, events) {
            return;
        }
    }
    panic!("condition not reached; events: {events:?}");
}

fn pump(engine: &AudioEngine, output: &mut OfflineOutput, frames: usize) {
    for _ in 0..frames {
        output.render_frame();
        thread::sleep(Duration::from_millis(1));
    }
    while engine.try_recv_event().is_some() {}
}

#[test]
fn queued_tracks_play_back_to_back_then_stop() {
    let (engine, mut output) = engine();
    engine.load(DeckSelector::Active, tone(200)).unwrap();
    engine.enqueue(tone(200)).unwrap();
    engine.play().unwrap();

    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |_, events| {
        events.contains(&EngineEvent::TrackFinished(DeckId::B))
    });
    pump_until(&engine, &mut output, &mut events, |engine, _| {
        engine.state() == PlaybackState::Stopped
    });

    assert!(events.contains(&EngineEvent::TrackFinished(DeckId::A)));
    assert!(events.contains(&EngineEvent::ActiveDeckChanged(DeckId::B)));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TrackLoaded { deck: DeckId::B, .. })));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Fault)));
}

#[test]
fn seek_beyond_duration_is_rejected() {
    let (engine, mut output) = engine();
    engine.load(DeckSelector::Active, tone(500)).unwrap();
    pump(&engine, &mut output, 2);
    assert_eq!(engine.state(), PlaybackState::Stopped);

    let err = engine.seek(Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, Error::SeekOutOfBounds { .. }));
    pump(&engine, &mut output, 2);
    assert_eq!(engine.state(), PlaybackState::Stopped);
    assert_eq!(engine.position(), Duration::ZERO);
}

#[test]
fn stop_rewinds_the_active_track() {
    let (engine, mut output) = engine();
    engine.load(DeckSelector::Active, tone(2_000)).unwrap();
    engine.play().unwrap();
    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |engine, _| {
        engine.position() >= Duration::from_millis(100)
    });

    engine.stop().unwrap();
    pump_until(&engine, &mut output, &mut events, |engine, _| {
        engine.state() == PlaybackState::Stopped && engine.position() == Duration::ZERO
    });
    assert_eq!(engine.duration(), Some(Duration::from_secs(2)));
}

#[test]
fn second_pause_changes_nothing() {
    let (engine, mut output) = engine();
    engine.load(DeckSelector::Active, tone(2_000)).unwrap();
    engine.play().unwrap();
    pump(&engine, &mut output, 10);

    engine.pause().unwrap();
    pump(&engine, &mut output, 3);
    assert_eq!(engine.state(), PlaybackState::Paused);
    let position = engine.position();

    engine.pause().unwrap();
    pump(&engine, &mut output, 5);
    assert_eq!(engine.state(), PlaybackState::Paused);
    assert_eq!(engine.position(), position);
    assert!(output.render_frame().is_silent());
}

#[test]
fn skip_with_empty_queue_reports_nothing_to_skip() {
    let (engine, mut output) = engine();
    engine.load(DeckSelector::Active, tone(2_000)).unwrap();
    engine.play().unwrap();
    pump(&engine, &mut output, 2);

    engine.skip_to_next().unwrap();
    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |_, events| {
        events.contains(&EngineEvent::NothingToSkipTo)
    });
    assert_eq!(engine.active_deck(), DeckId::A);
    assert_eq!(engine.state(), PlaybackState::Playing);
}

#[test]
fn unload_returns_to_idle() {
    let (engine, mut output) = engine();
    engine.load(DeckSelector::Active, tone(2_000)).unwrap();
    engine.enqueue(tone(2_000)).unwrap();
    engine.play().unwrap();
    pump(&engine, &mut output, 5);

    engine.unload().unwrap();
    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |engine, _| {
        engine.state() == PlaybackState::Idle
    });
    assert!(output.render_frame().is_silent());
}

#[test]
fn slow_open_does_not_starve_the_playing_deck() {
    let (engine, mut output) = slow_engine(Duration::from_millis(600));
    engine.load(DeckSelector::Active, tone(20_000)).unwrap();
    engine.play().unwrap();
    pump(&engine, &mut output, 10);

    engine.enqueue(tone(1_000)).unwrap();
    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |_, events| {
        events
            .iter()
            .any(|e| matches!(e, EngineEvent::TrackLoaded { deck: DeckId::B, .. }))
    });

    // A kept playing the whole time the next source was opening.
    assert_eq!(engine.underruns(), 0);
    assert_eq!(engine.active_deck(), DeckId::A);
    assert_eq!(engine.state(), PlaybackState::Playing);
    assert!(!output.render_frame().is_silent());
}

#[test]
fn track_ending_during_next_open_continues_to_it() {
    let (engine, mut output) = slow_engine(Duration::from_millis(300));
    engine.load(DeckSelector::Active, tone(200)).unwrap();
    engine.enqueue(tone(300)).unwrap();
    engine.play().unwrap();

    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |_, events| {
        events.contains(&EngineEvent::ActiveDeckChanged(DeckId::B))
    });
    let finished = events
        .iter()
        .position(|e| *e == EngineEvent::TrackFinished(DeckId::A))
        .unwrap();
    let loaded = events
        .iter()
        .position(|e| matches!(e, EngineEvent::TrackLoaded { deck: DeckId::B, .. }))
        .unwrap();
    // A ran out before B was ready, and playback waited instead of stopping.
    assert!(finished < loaded);
    assert!(!events[finished..].contains(&EngineEvent::StateChanged(PlaybackState::Stopped)));

    pump_until(&engine, &mut output, &mut events, |_, events| {
        events.contains(&EngineEvent::TrackFinished(DeckId::B))
    });
    pump_until(&engine, &mut output, &mut events, |engine, _| {
        engine.state() == PlaybackState::Stopped
    });
}

#[test]
fn stop_abandons_a_load_in_flight() {
    let (engine, mut output) = slow_engine(Duration::from_millis(500));

    let result = thread::scope(|scope| {
        let loading = scope.spawn(|| engine.load(DeckSelector::Active, tone(1_000)));
        thread::sleep(Duration::from_millis(100));
        engine.stop().unwrap();
        loading.join().unwrap()
    });
    assert!(matches!(result, Err(Error::Cancelled)));

    // The open completes later and is thrown away.
    thread::sleep(Duration::from_millis(600));
    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |engine, _| {
        engine.state() == PlaybackState::Stopped
    });
    pump(&engine, &mut output, 5);
    assert_eq!(engine.state(), PlaybackState::Stopped);
    assert_eq!(engine.duration(), None);
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::TrackLoaded { .. })));
    assert!(engine.play().is_ok());
    pump(&engine, &mut output, 2);
    assert_ne!(engine.state(), PlaybackState::Playing);
}

#[test]
fn decode_error_ends_the_track_and_moves_on() {
    let mut settings = settings();
    settings.crossfade.enabled = false;
    // Eight 1024-sample packets at 8 kHz: about a second plays before the failure.
    let backend = BrokenBackend {
        good_packets: 8,
        tones: ToneBackend::with_sample_rate(8_000),
    };
    let (engine, mut output) = engine_with(settings, Arc::new(backend));
    engine.load(DeckSelector::Active, tone(5_000)).unwrap();
    engine.enqueue(tone(5_000)).unwrap();
    engine.play().unwrap();

    let mut events = Vec::new();
    pump_until(&engine, &mut output, &mut events, |_, events| {
        events.contains(&EngineEvent::ActiveDeckChanged(DeckId::B))
    });
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::DecodeError { deck: DeckId::A, .. })));
    assert!(events.contains(&EngineEvent::TrackFinished(DeckId::A)));
    assert_eq!(engine.state(), PlaybackState::Playing);
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Fault)));
}
