//! Deterministic harness: a scheduler with both deck pipelines, driven frame
//! by frame with the rings topped up in between, standing in for the output
//! callback and the control worker.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;
use std::time::Duration;

use harmony_audio::adapter::DecoderAdapter;
use harmony_audio::command::{
    rt_command_channel, rt_event_channel, RtCommand, RtEvent, RtSender, SharedStatus,
};
use harmony_audio::pipeline::{deck_pipeline, DeckFeeder};
use harmony_audio::{PlaybackScheduler, ToneBackend};
use harmony_core::{DeckId, EngineSettings, Frame, FrameFormat, TrackSource};

pub struct Rig {
    pub scheduler: PlaybackScheduler,
    pub feeders: [DeckFeeder; 2],
    pub tx: RtSender,
    pub events: rtrb::Consumer<RtEvent>,
    pub status: Arc<SharedStatus>,
    pub format: FrameFormat,
    pub frame: Frame,
    backend: ToneBackend,
}

impl Rig {
    pub fn new(format: FrameFormat, settings: &EngineSettings) -> Self {
        let buffer = settings.buffer.buffer();
        let (feeder_a, reader_a) = deck_pipeline(DeckId::A, format, buffer);
        let (feeder_b, reader_b) = deck_pipeline(DeckId::B, format, buffer);
        let (tx, commands) = rt_command_channel();
        let (events_tx, events) = rt_event_channel();
        let status = Arc::new(SharedStatus::default());
        let scheduler = PlaybackScheduler::new(
            format,
            settings,
            [reader_a, reader_b],
            commands,
            events_tx,
            Arc::clone(&status),
        );
        Self {
            scheduler,
            feeders: [feeder_a, feeder_b],
            tx,
            events,
            status,
            format,
            frame: Frame::silence(&format),
            backend: ToneBackend::with_sample_rate(format.sample_rate),
        }
    }

    /// Open a tone of `length` on `deck` and prime it, as the worker does.
    pub fn load_tone(&mut self, deck: DeckId, length: Duration) {
        let generation = self.begin_load(deck);
        self.finish_tone(deck, generation, length);
    }

    /// Announce a load on `deck` without opening anything yet.
    pub fn begin_load(&mut self, deck: DeckId) -> u64 {
        let generation = self.feeders[deck.index()].begin_load();
        self.send(RtCommand::DeckLoading { deck, generation });
        generation
    }

    /// Complete a load started with [`Rig::begin_load`].
    pub fn finish_tone(&mut self, deck: DeckId, generation: u64, length: Duration) {
        let source = TrackSource::Tone {
            frequency_hz: 330.0,
            duration: length,
        };
        let (adapter, handle) = DecoderAdapter::open(&self.backend, &source, self.format).unwrap();
        let duration = handle
            .duration()
            .map(|d| self.format.duration_to_samples(d));
        let feeder = &mut self.feeders[deck.index()];
        feeder.install(adapter, handle);
        feeder.prime().unwrap();

        self.send(RtCommand::DeckLoaded {
            deck,
            generation,
            duration,
            normalization_db: 0.0,
            seekable: true,
        });
    }

    pub fn send(&self, command: RtCommand) {
        self.tx.send(command).unwrap();
    }

    /// Top up both rings, then render one frame.
    pub fn step(&mut self) {
        for feeder in &mut self.feeders {
            feeder.fill().unwrap();
        }
        self.scheduler.render(&mut self.frame);
    }

    pub fn run(&mut self, frames: usize) {
        for _ in 0..frames {
            self.step();
        }
    }

    /// Render without refilling, as if the decoder had stalled.
    pub fn run_starved(&mut self, frames: usize) {
        for _ in 0..frames {
            self.scheduler.render(&mut self.frame);
        }
    }

    pub fn drain_events(&mut self) -> Vec<RtEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.pop() {
            out.push(event);
        }
        out
    }

    pub fn seconds(&self, seconds: f64) -> usize {
        (seconds * f64::from(self.format.sample_rate)).round() as usize / self.format.frame_len
    }
}

/// Settings with every smoothing feature that would blur exact assertions off.
pub fn plain_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.volume = 1.0;
    settings.normalization.enabled = false;
    settings.buffer.fade_on_pause = false;
    settings.buffer.buffer_ms = 200;
    settings
}
