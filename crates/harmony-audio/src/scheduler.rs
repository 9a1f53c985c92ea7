//! Real-time playback scheduler.
//!
//! [`PlaybackScheduler::render`] produces exactly one frame per call. It runs
//! in the output callback, so nothing here blocks, allocates, logs, or takes a
//! lock: commands arrive through the `rtrb` queue and are applied at the
//! frame boundary, and anything worth reporting leaves as an [`RtEvent`].

use std::sync::Arc;

use harmony_core::{DeckId, EngineSettings, Frame, FrameFormat, PlaybackState, Transition};

use crate::command::{RtCommand, RtEvent, SharedStatus};
use crate::dsp::DspChain;
use crate::mixer::{CrossfadeMixer, MixerState};
use crate::pipeline::{DeckRead, DeckReader};

/// What a deck holds, as far as the scheduler knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeckStatus {
    Empty,
    /// Opening and priming under `generation`.
    Loading { generation: u64 },
    /// Primed and playable.
    Ready,
    /// The end of the track was played.
    Ended,
}

/// Pause/resume click suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseRamp {
    None,
    /// Render one more frame, fading out.
    Out,
    /// Fade in the next rendered frame.
    In,
}

struct Deck {
    reader: DeckReader,
    chain: DspChain,
    status: DeckStatus,
    /// Per-channel samples, if known.
    duration: Option<u64>,
    seekable: bool,
    /// Position of the next sample to be heard.
    position: u64,
    /// Consecutive frames this deck could not deliver.
    starved: u32,
    /// Just loaded or seeked; an empty ring is expected, not an underrun.
    awaiting: bool,
}

impl Deck {
    fn new(reader: DeckReader, chain: DspChain) -> Self {
        Self {
            reader,
            chain,
            status: DeckStatus::Empty,
            duration: None,
            seekable: false,
            position: 0,
            starved: 0,
            awaiting: false,
        }
    }

    const fn is_ready(&self) -> bool {
        matches!(self.status, DeckStatus::Ready)
    }

    fn remaining(&self) -> Option<u64> {
        self.duration.map(|d| d.saturating_sub(self.position))
    }

    /// Pull and process one frame.
    fn pull(
        &mut self,
        frame: &mut Frame,
        frame_len: u64,
        events: &mut rtrb::Producer<RtEvent>,
        status: &SharedStatus,
    ) -> DeckRead {
        let read = self.reader.next_frame(frame);
        match read {
            DeckRead::Audio => {
                if self.starved > 0 && !self.awaiting {
                    let _ = events.push(RtEvent::UnderrunRecovered {
                        deck: self.reader.deck(),
                        frames: self.starved,
                    });
                }
                self.starved = 0;
                self.awaiting = false;
                self.position = frame.position + frame_len;
                self.chain.process(frame);
            }
            DeckRead::EndOfTrack => {
                self.status = DeckStatus::Ended;
                self.starved = 0;
                if let Some(duration) = self.duration {
                    self.position = self.position.max(duration);
                }
            }
            DeckRead::Underrun if !self.awaiting => {
                self.starved = self.starved.saturating_add(1);
                status.add_underrun();
                if self.starved == 1 {
                    let _ = events.push(RtEvent::Underrun(self.reader.deck()));
                }
            }
            DeckRead::Underrun | DeckRead::Waiting => {}
        }
        read
    }
}

/// Owns both decks, the mixer and the playback state machine.
pub struct PlaybackScheduler {
    format: FrameFormat,
    commands: rtrb::Consumer<RtCommand>,
    events: rtrb::Producer<RtEvent>,
    status: Arc<SharedStatus>,
    tap: Option<rtrb::Producer<f32>>,
    decks: [Deck; 2],
    active: DeckId,
    state: PlaybackState,
    mixer: CrossfadeMixer,
    crossfade_enabled: bool,
    /// Configured crossfade length in per-channel samples.
    crossfade_samples: u64,
    /// Start playback once the active deck is primed.
    play_pending: bool,
    /// Skip as soon as the other deck is primed.
    skip_pending: bool,
    /// The active track ran out while the other deck was still loading.
    /// Output is silent until that deck is primed, then it takes over.
    advance_pending: bool,
    fade_on_pause: bool,
    pause_ramp: PauseRamp,
    max_underruns: u32,
    /// Render target for the incoming deck during a fade.
    scratch: Frame,
}

impl PlaybackScheduler {
    pub fn new(
        format: FrameFormat,
        settings: &EngineSettings,
        readers: [DeckReader; 2],
        commands: rtrb::Consumer<RtCommand>,
        events: rtrb::Producer<RtEvent>,
        status: Arc<SharedStatus>,
    ) -> Self {
        let [reader_a, reader_b] = readers;
        let decks = [
            Deck::new(reader_a, DspChain::new(format, settings)),
            Deck::new(reader_b, DspChain::new(format, settings)),
        ];

        status.set_state(PlaybackState::Idle);
        status.set_active_deck(DeckId::A);

        Self {
            format,
            commands,
            events,
            status,
            tap: None,
            decks,
            active: DeckId::A,
            state: PlaybackState::Idle,
            mixer: CrossfadeMixer::new(settings.crossfade.curve, usize::from(format.channels)),
            crossfade_enabled: settings.crossfade.enabled,
            crossfade_samples: format.duration_to_samples(settings.crossfade.duration()),
            play_pending: false,
            skip_pending: false,
            advance_pending: false,
            fade_on_pause: settings.buffer.fade_on_pause,
            pause_ramp: PauseRamp::None,
            max_underruns: settings.buffer.max_consecutive_underruns,
            scratch: Frame::silence(&format),
        }
    }

    /// Mirror every rendered sample into `tap`, dropping what does not fit.
    pub fn set_visualizer_tap(&mut self, tap: rtrb::Producer<f32>) {
        self.tap = Some(tap);
    }

    pub const fn format(&self) -> FrameFormat {
        self.format
    }

    pub const fn state(&self) -> PlaybackState {
        self.state
    }

    pub const fn active_deck(&self) -> DeckId {
        self.active
    }

    pub const fn mixer_state(&self) -> MixerState {
        self.mixer.state()
    }

    pub const fn deck_status(&self, deck: DeckId) -> DeckStatus {
        self.decks[deck.index()].status
    }

    pub const fn deck_position(&self, deck: DeckId) -> u64 {
        self.decks[deck.index()].position
    }

    pub const fn deck_chain(&self, deck: DeckId) -> &DspChain {
        &self.decks[deck.index()].chain
    }

    /// Render the next frame into `out`.
    pub fn render(&mut self, out: &mut Frame) {
        self.drain_commands();

        let fading_out = self.pause_ramp == PauseRamp::Out;
        if self.state.is_audible() || fading_out {
            self.render_audio(out);
            match self.pause_ramp {
                PauseRamp::Out => {
                    ramp_frame(out, usize::from(self.format.channels), 1.0, 0.0);
                    self.pause_ramp = PauseRamp::None;
                }
                PauseRamp::In => {
                    ramp_frame(out, usize::from(self.format.channels), 0.0, 1.0);
                    self.pause_ramp = PauseRamp::None;
                }
                PauseRamp::None => {}
            }
            self.check_starvation(out);
        } else {
            out.clear();
        }

        if let Some(tap) = self.tap.as_mut() {
            let count = tap.slots().min(out.samples().len());
            for sample in &out.samples()[..count] {
                let _ = tap.push(*sample);
            }
        }

        self.publish();
    }

    fn render_audio(&mut self, out: &mut Frame) {
        if self.advance_pending {
            out.clear();
            return;
        }

        let from = self.active;
        let to = from.other();
        let frame_len = self.format.frame_len as u64;

        let read = self.decks[from.index()].pull(out, frame_len, &mut self.events, &self.status);

        if self.mixer.is_fading() {
            let incoming = self.decks[to.index()].pull(
                &mut self.scratch,
                frame_len,
                &mut self.events,
                &self.status,
            );

            let done = if read == DeckRead::EndOfTrack {
                // The outgoing track ran out first: cut the fade short.
                out.samples_mut().copy_from_slice(self.scratch.samples());
                self.mixer.finish();
                true
            } else {
                self.mixer.mix(out.samples_mut(), self.scratch.samples())
            };

            if done {
                self.complete_crossfade();
                if incoming == DeckRead::EndOfTrack {
                    self.active_track_ended(out);
                }
            }
            return;
        }

        match read {
            DeckRead::EndOfTrack => self.active_track_ended(out),
            DeckRead::Audio => self.maybe_start_auto_crossfade(),
            DeckRead::Underrun | DeckRead::Waiting => {}
        }
    }

    /// The active deck reached its end outside a fade: cut to the other deck
    /// if it is primed, wait for it if it is loading, else stop.
    fn active_track_ended(&mut self, out: &mut Frame) {
        let from = self.active;
        let to = from.other();
        self.emit(RtEvent::TrackFinished(from));

        if self.decks[to.index()].is_ready() {
            self.switch_active(to);
            self.decks[from.index()].status = DeckStatus::Empty;
            self.emit(RtEvent::DeckReleased(from));
            let frame_len = self.format.frame_len as u64;
            let read = self.decks[to.index()].pull(out, frame_len, &mut self.events, &self.status);
            if read == DeckRead::EndOfTrack {
                self.active_track_ended(out);
            }
        } else if matches!(self.decks[to.index()].status, DeckStatus::Loading { .. }) {
            out.clear();
            self.advance_pending = true;
        } else {
            out.clear();
            self.transition(Transition::Finished);
        }
    }

    fn maybe_start_auto_crossfade(&mut self) {
        if !self.crossfade_enabled || self.crossfade_samples == 0 {
            return;
        }
        let active = &self.decks[self.active.index()];
        let other = &self.decks[self.active.other().index()];
        if !other.is_ready() {
            return;
        }
        if let Some(remaining) = active.remaining() {
            if remaining > 0 && remaining <= self.crossfade_samples {
                self.start_crossfade(remaining);
            }
        }
    }

    fn start_crossfade(&mut self, samples: u64) {
        let from = self.active;
        let to = from.other();
        if self.mixer.start(samples) {
            self.emit(RtEvent::CrossfadeStarted { from, to, samples });
            if self.state == PlaybackState::Playing {
                self.set_state(PlaybackState::Crossfading);
            }
        }
    }

    fn complete_crossfade(&mut self) {
        self.mixer.finish();
        let from = self.active;
        let to = from.other();
        self.switch_active(to);
        self.decks[from.index()].status = DeckStatus::Empty;
        self.emit(RtEvent::CrossfadeFinished(to));
        self.emit(RtEvent::DeckReleased(from));
        if self.state == PlaybackState::Crossfading {
            self.set_state(PlaybackState::Playing);
        }
    }

    /// Drop a fade without switching decks (the incoming deck went away).
    fn abandon_crossfade(&mut self) {
        if self.mixer.is_fading() {
            self.mixer.finish();
            if self.state == PlaybackState::Crossfading {
                self.set_state(PlaybackState::Playing);
            }
        }
    }

    fn switch_active(&mut self, deck: DeckId) {
        if self.active != deck {
            self.active = deck;
            self.status.set_active_deck(deck);
            self.emit(RtEvent::ActiveDeckChanged(deck));
        }
    }

    fn skip_to_next(&mut self) {
        let from = self.active;
        let to = from.other();

        if self.mixer.is_fading() {
            self.complete_crossfade();
            return;
        }

        match self.decks[to.index()].status {
            DeckStatus::Ready => {
                self.skip_pending = false;
                if self.crossfade_enabled && self.crossfade_samples > 0 && self.state.is_audible() {
                    self.start_crossfade(self.crossfade_samples);
                } else {
                    self.switch_active(to);
                    self.decks[from.index()].status = DeckStatus::Empty;
                    self.emit(RtEvent::DeckReleased(from));
                }
            }
            DeckStatus::Loading { .. } => self.skip_pending = true,
            DeckStatus::Empty | DeckStatus::Ended => self.emit(RtEvent::NothingToSkipTo),
        }
    }

    /// Too many silent frames in a row on the audible deck is a fault.
    fn check_starvation(&mut self, out: &mut Frame) {
        if self.max_underruns == 0 || self.state == PlaybackState::Error {
            return;
        }
        if self.decks[self.active.index()].starved > self.max_underruns {
            out.clear();
            self.mixer.finish();
            self.decks[self.active.index()].starved = 0;
            self.emit(RtEvent::Fault);
            self.transition(Transition::Fault);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: RtCommand) {
        match command {
            RtCommand::DeckLoading { deck, generation } => self.deck_loading(deck, generation),
            RtCommand::DeckLoaded {
                deck,
                generation,
                duration,
                normalization_db,
                seekable,
            } => {
                let slot = &mut self.decks[deck.index()];
                if slot.status != (DeckStatus::Loading { generation }) {
                    return;
                }
                slot.status = DeckStatus::Ready;
                slot.duration = duration;
                slot.seekable = seekable;
                slot.position = 0;
                slot.chain.reset_for_track(f64::from(normalization_db));

                if deck == self.active {
                    if self.state == PlaybackState::Loading {
                        let play_pending = std::mem::take(&mut self.play_pending);
                        self.transition(Transition::Primed { play_pending });
                    }
                } else if self.advance_pending {
                    self.advance_pending = false;
                    self.skip_pending = false;
                    let from = self.active;
                    self.switch_active(deck);
                    self.decks[from.index()].status = DeckStatus::Empty;
                    self.emit(RtEvent::DeckReleased(from));
                } else if self.skip_pending {
                    self.skip_pending = false;
                    self.skip_to_next();
                }
            }
            RtCommand::DeckLoadFailed { deck, generation } => {
                let slot = &mut self.decks[deck.index()];
                if slot.status != (DeckStatus::Loading { generation }) {
                    return;
                }
                slot.status = DeckStatus::Empty;
                slot.awaiting = false;

                if deck == self.active {
                    self.skip_pending = false;
                    let other = deck.other();
                    let track_loaded = self.decks[other.index()].is_ready();
                    if track_loaded {
                        self.switch_active(other);
                    }
                    self.play_pending = false;
                    self.transition(Transition::LoadFailed { track_loaded });
                } else {
                    self.skip_pending = false;
                    if std::mem::take(&mut self.advance_pending) {
                        // Nothing left to play.
                        self.transition(Transition::Stop);
                    }
                }
            }
            RtCommand::DeckSeeked {
                deck,
                generation,
                position,
            } => {
                let slot = &mut self.decks[deck.index()];
                slot.reader.accept(generation);
                slot.position = position;
                slot.starved = 0;
                slot.awaiting = true;
                if slot.status == DeckStatus::Ended {
                    slot.status = DeckStatus::Ready;
                }
                if deck == self.active {
                    self.advance_pending = false;
                }
            }
            RtCommand::DeckCleared { deck, generation } => {
                if self.mixer.is_fading() && deck == self.active.other() {
                    self.abandon_crossfade();
                }
                let slot = &mut self.decks[deck.index()];
                slot.reader.accept(generation);
                slot.status = DeckStatus::Empty;
                slot.duration = None;
                slot.position = 0;
                slot.starved = 0;
                slot.awaiting = false;
                if deck != self.active && std::mem::take(&mut self.advance_pending) {
                    self.transition(Transition::Stop);
                }
            }
            RtCommand::Play => self.play(),
            RtCommand::Pause => self.pause(),
            RtCommand::Stop => self.stop(),
            RtCommand::Unload => {
                self.abandon_crossfade();
                self.pause_ramp = PauseRamp::None;
                self.play_pending = false;
                self.skip_pending = false;
                self.advance_pending = false;
                self.transition(Transition::Unload);
            }
            RtCommand::SetVolume(level) => {
                for deck in &mut self.decks {
                    deck.chain.set_volume(level);
                }
            }
            RtCommand::SetEqBand { index, gain_db } => {
                for deck in &mut self.decks {
                    deck.chain.set_eq_band(index, gain_db);
                }
            }
            RtCommand::SetEqGains(gains) => {
                for deck in &mut self.decks {
                    deck.chain.set_eq_gains(&gains);
                }
            }
            RtCommand::SetCrossfade {
                enabled,
                duration_ms,
            } => {
                self.crossfade_enabled = enabled;
                self.crossfade_samples = self
                    .format
                    .duration_to_samples(std::time::Duration::from_millis(u64::from(duration_ms)));
            }
            RtCommand::SetFadeCurve(curve) => self.mixer.set_curve(curve),
            RtCommand::SkipToNext => self.skip_to_next(),
            RtCommand::DeviceFailed => {
                self.abandon_crossfade();
                self.pause_ramp = PauseRamp::None;
                self.advance_pending = false;
                self.transition(Transition::Stop);
            }
        }
    }

    fn deck_loading(&mut self, deck: DeckId, generation: u64) {
        if self.mixer.is_fading() {
            if deck == self.active {
                self.complete_crossfade();
            } else {
                self.abandon_crossfade();
            }
        }

        // With nothing on the active deck, a load on the other one takes over.
        let active_idle = matches!(
            self.decks[self.active.index()].status,
            DeckStatus::Empty | DeckStatus::Ended
        );
        if deck != self.active && active_idle && !self.state.is_audible() {
            self.switch_active(deck);
        }
        if deck == self.active {
            self.advance_pending = false;
        }

        let slot = &mut self.decks[deck.index()];
        slot.reader.accept(generation);
        slot.status = DeckStatus::Loading { generation };
        slot.duration = None;
        slot.position = 0;
        slot.starved = 0;
        slot.awaiting = true;

        if deck == self.active {
            let was_playing = self.state.is_audible();
            if self.transition(Transition::Load) {
                self.play_pending = was_playing || self.play_pending;
                self.pause_ramp = PauseRamp::None;
            }
        }
    }

    fn play(&mut self) {
        match self.state {
            PlaybackState::Loading => self.play_pending = true,
            PlaybackState::Stopped | PlaybackState::Paused => {
                let waiting = self.advance_pending && self.state == PlaybackState::Paused;
                if !waiting && !self.decks[self.active.index()].is_ready() {
                    let other = self.active.other();
                    if !self.decks[other.index()].is_ready() {
                        return;
                    }
                    self.switch_active(other);
                }
                let resuming = self.state == PlaybackState::Paused;
                if self.transition(Transition::Play) {
                    if self.mixer.is_fading() {
                        self.set_state(PlaybackState::Crossfading);
                    }
                    if resuming && self.fade_on_pause {
                        self.pause_ramp = PauseRamp::In;
                    }
                }
            }
            _ => {}
        }
    }

    fn pause(&mut self) {
        match self.state {
            PlaybackState::Loading => self.play_pending = false,
            PlaybackState::Playing | PlaybackState::Crossfading => {
                if self.transition(Transition::Pause) && self.fade_on_pause {
                    self.pause_ramp = PauseRamp::Out;
                }
            }
            // Already paused: nothing to do.
            _ => {}
        }
    }

    fn stop(&mut self) {
        if self.mixer.is_fading() {
            self.complete_crossfade();
        }
        if self.transition(Transition::Stop) {
            self.pause_ramp = PauseRamp::None;
            self.play_pending = false;
            self.skip_pending = false;
            self.advance_pending = false;
        }
    }

    fn transition(&mut self, transition: Transition) -> bool {
        match self.state.apply(transition) {
            Some(next) => {
                self.set_state(next);
                true
            }
            None => false,
        }
    }

    fn set_state(&mut self, next: PlaybackState) {
        if next != self.state {
            self.state = next;
            self.status.set_state(next);
            self.emit(RtEvent::StateChanged(next));
        }
    }

    fn emit(&mut self, event: RtEvent) {
        // A full queue means nobody is listening closely; drop.
        let _ = self.events.push(event);
    }

    fn publish(&self) {
        let deck = &self.decks[self.active.index()];
        self.status.set_position(deck.position);
        self.status.set_duration(deck.duration);
        self.status.set_fading(self.mixer.is_fading());
    }
}

/// Multiply a frame by a linear ramp from `from` to `to`.
fn ramp_frame(frame: &mut Frame, channels: usize, from: f32, to: f32) {
    let samples = frame.samples_mut();
    let frames = samples.len() / channels.max(1);
    if frames == 0 {
        return;
    }
    let step = (to - from) / frames as f32;
    for (index, chunk) in samples.chunks_exact_mut(channels).enumerate() {
        let gain = from + step * (index + 1) as f32;
        chunk.iter_mut().for_each(|s| *s *= gain);
    }
}
