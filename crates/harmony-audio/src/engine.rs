//! Audio engine facade and the control worker behind it.
//!
//! The facade is the only public control surface. Calls that need blocking
//! work (opening a source, seeking a decoder) go to the worker thread over a
//! crossbeam channel and wait for its verdict; everything else is pushed
//! straight onto the real-time command queue.
//!
//! Sources are opened on a separate opener thread, so a slow file or network
//! open never holds up the worker's ring top-ups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use harmony_core::{
    DeckId, DeckSelector, EngineSettings, EqPreset, Error, FadeCurve, FrameFormat,
    NormalizationSettings, PlaybackState, Result, TrackInfo, TrackSource, EQ_BAND_COUNT,
    EQ_MAX_GAIN_DB, EQ_MIN_GAIN_DB, MAX_CROSSFADE_MS,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapter::{DecodeBackend, DecoderAdapter, SourceRouter, TrackHandle};
use crate::command::{
    rt_command_channel, rt_event_channel, RtCommand, RtEvent, RtSender, SharedStatus,
};
use crate::dsp::normalization_gain_db;
use crate::output::{DeviceOutput, OfflineOutput, OutputDevice};
use crate::pipeline::{deck_pipeline, DeckFeeder};
use crate::scheduler::PlaybackScheduler;

/// How long the worker sleeps between ring top-ups when idle.
const FILL_INTERVAL: Duration = Duration::from_millis(2);

/// Frames of audio the visualizer tap can hold.
const TAP_FRAMES: usize = 64;

/// Events emitted by the audio engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Playback state changed.
    StateChanged(PlaybackState),
    /// A track was opened and primed on `deck`.
    TrackLoaded { deck: DeckId, info: TrackInfo },
    /// A queued track could not be opened.
    LoadFailed {
        deck: DeckId,
        source: TrackSource,
        error: String,
    },
    ActiveDeckChanged(DeckId),
    /// The track on `deck` played to its end.
    TrackFinished(DeckId),
    CrossfadeStarted {
        from: DeckId,
        to: DeckId,
        duration: Duration,
    },
    CrossfadeFinished(DeckId),
    /// `skip_to_next` found nothing to play.
    NothingToSkipTo,
    /// Decoding failed mid-track; the track was ended early.
    DecodeError { deck: DeckId, error: String },
    /// The output device failed. Playback stopped.
    DeviceError(String),
    /// Playback faulted after repeated underruns.
    Fault,
}

/// Requests serviced by the control worker.
enum WorkerCommand {
    Load {
        deck: DeckSelector,
        source: TrackSource,
        epoch: u64,
        reply: Sender<Result<TrackInfo>>,
    },
    Seek {
        position: Duration,
        reply: Sender<Result<()>>,
    },
    Stop,
    Unload,
    Enqueue(TrackSource),
    ClearQueue,
    DeviceFailed(String),
    Shutdown,
}

/// A source for the opener thread.
struct OpenRequest {
    deck: DeckId,
    generation: u64,
    source: TrackSource,
}

/// What the opener made of an [`OpenRequest`].
struct Opened {
    deck: DeckId,
    generation: u64,
    result: Result<(DecoderAdapter, TrackHandle)>,
}

/// A load the worker is waiting on.
struct PendingLoad {
    generation: u64,
    source: TrackSource,
    /// Cancel epoch when the caller asked.
    epoch: u64,
    /// The facade caller to answer. Queued tracks have none.
    reply: Option<Sender<Result<TrackInfo>>>,
}

/// Start the opener thread. It exits once the request side is dropped.
fn spawn_opener(
    backend: Arc<dyn DecodeBackend>,
    format: FrameFormat,
) -> Result<(Sender<OpenRequest>, Receiver<Opened>)> {
    let (request_tx, requests) = unbounded::<OpenRequest>();
    let (opened_tx, opened) = unbounded();

    std::thread::Builder::new()
        .name("track-opener".to_string())
        .spawn(move || {
            for request in requests {
                debug!("Opening {} for deck {}", request.source, request.deck);
                let result = DecoderAdapter::open(backend.as_ref(), &request.source, format);
                let opened = Opened {
                    deck: request.deck,
                    generation: request.generation,
                    result,
                };
                if opened_tx.send(opened).is_err() {
                    break;
                }
            }
            debug!("Track opener stopped");
        })
        .map_err(|e| Error::Internal(format!("Failed to spawn opener thread: {e}")))?;

    Ok((request_tx, opened))
}

/// Handles shared by the facade and the worker.
struct Shared {
    rt: RtSender,
    status: Arc<SharedStatus>,
    cancel: Arc<AtomicU64>,
    device_error: Arc<Mutex<Option<String>>>,
    tap: rtrb::Consumer<f32>,
}

/// Build the scheduler, the worker and the facade's shared handles for one
/// engine instance.
fn assemble(
    format: FrameFormat,
    settings: &EngineSettings,
    backend: Arc<dyn DecodeBackend>,
    command_rx: Receiver<WorkerCommand>,
    event_tx: Sender<EngineEvent>,
) -> Result<(PlaybackScheduler, EngineWorker, Shared)> {
    let (opener, opened) = spawn_opener(backend, format)?;
    let buffer = settings.buffer.buffer();
    let (feeder_a, reader_a) = deck_pipeline(DeckId::A, format, buffer);
    let (feeder_b, reader_b) = deck_pipeline(DeckId::B, format, buffer);

    let (rt, rt_commands) = rt_command_channel();
    let (rt_events_tx, rt_events) = rt_event_channel();
    let status = Arc::new(SharedStatus::default());
    let cancel = Arc::new(AtomicU64::new(0));
    let device_error = Arc::new(Mutex::new(None));

    let mut scheduler = PlaybackScheduler::new(
        format,
        settings,
        [reader_a, reader_b],
        rt_commands,
        rt_events_tx,
        Arc::clone(&status),
    );
    let (tap_tx, tap) = rtrb::RingBuffer::new(format.samples_per_frame() * TAP_FRAMES);
    scheduler.set_visualizer_tap(tap_tx);

    let worker = EngineWorker {
        command_rx,
        event_tx,
        rt: rt.clone(),
        rt_events,
        status: Arc::clone(&status),
        cancel: Arc::clone(&cancel),
        device_error: Arc::clone(&device_error),
        opener,
        opened,
        format,
        normalization: settings.normalization,
        feeders: [feeder_a, feeder_b],
        loaded: [None, None],
        pending: [None, None],
        queue: VecDeque::new(),
    };

    let shared = Shared {
        rt,
        status,
        cancel,
        device_error,
        tap,
    };

    Ok((scheduler, worker, shared))
}

/// Open the output device and start the stream with a fresh scheduler.
fn start_device(
    settings: &EngineSettings,
    device_name: Option<&str>,
    command_rx: Receiver<WorkerCommand>,
    event_tx: Sender<EngineEvent>,
    failure_tx: Sender<WorkerCommand>,
) -> Result<(EngineWorker, Shared, DeviceOutput)> {
    let device = match device_name {
        Some(name) => OutputDevice::open_named(name)?,
        None => OutputDevice::open_default()?,
    };
    let format = device.frame_format(settings.buffer.frame_len)?;
    let (scheduler, worker, shared) = assemble(
        format,
        settings,
        Arc::new(SourceRouter::default()),
        command_rx,
        event_tx,
    )?;

    let rt = shared.rt.clone();
    let output = device.start(scheduler, move |err| {
        // cpal's error path, not the audio callback.
        let _ = rt.send(RtCommand::DeviceFailed);
        let _ = failure_tx.send(WorkerCommand::DeviceFailed(err.to_string()));
    })?;

    info!(
        "Audio output initialized: {} Hz, {} channels, device: {}",
        output.sample_rate(),
        output.channels(),
        output.device_name()
    );
    Ok((worker, shared, output))
}

/// Two-deck playback engine.
pub struct AudioEngine {
    format: FrameFormat,
    command_tx: Sender<WorkerCommand>,
    event_rx: Receiver<EngineEvent>,
    rt: RtSender,
    status: Arc<SharedStatus>,
    /// Bumped by `stop`/`unload`; loads started under an older epoch are discarded.
    cancel: Arc<AtomicU64>,
    /// Set by the worker once the output device has failed.
    device_error: Arc<Mutex<Option<String>>>,
    volume: Mutex<f32>,
    eq_gains: Mutex<[f32; EQ_BAND_COUNT]>,
    crossfade: Mutex<(bool, u32)>,
    tap: Mutex<Option<rtrb::Consumer<f32>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioEngine {
    /// Start the engine on the default output device.
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Self::with_device(settings, None)
    }

    /// Start the engine on the named output device, or the default one.
    pub fn with_device(settings: EngineSettings, device_name: Option<String>) -> Result<Self> {
        settings.validate()?;

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (init_tx, init_rx) = bounded(1);
        let failure_tx = command_tx.clone();
        let thread_settings = settings.clone();

        // The output stream is created inside the worker thread (cpal::Stream is not Send).
        let handle = std::thread::Builder::new()
            .name("audio-engine".to_string())
            .spawn(move || {
                let started = start_device(
                    &thread_settings,
                    device_name.as_deref(),
                    command_rx,
                    event_tx,
                    failure_tx,
                );
                match started {
                    Ok((worker, shared, output)) => {
                        let format = worker.format;
                        let _ = init_tx.send(Ok((shared, format)));
                        // Keep output alive for the duration of the worker.
                        let _output = output;
                        worker.run();
                    }
                    Err(e) => {
                        error!("Failed to initialize audio: {e}");
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn engine thread: {e}")))?;

        let (shared, format) = init_rx.recv().map_err(|_| Error::EngineShutdown)??;
        Ok(Self::from_parts(
            &settings, format, command_tx, event_rx, shared, handle,
        ))
    }

    /// Start the engine without an output device.
    ///
    /// The returned [`OfflineOutput`] owns the scheduler; audio only advances
    /// when it is rendered.
    pub fn offline(
        settings: EngineSettings,
        format: FrameFormat,
        backend: Arc<dyn DecodeBackend>,
    ) -> Result<(Self, OfflineOutput)> {
        settings.validate()?;

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (scheduler, worker, shared) =
            assemble(format, &settings, backend, command_rx, event_tx)?;

        let handle = std::thread::Builder::new()
            .name("audio-engine".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::Internal(format!("Failed to spawn engine thread: {e}")))?;

        let engine = Self::from_parts(&settings, format, command_tx, event_rx, shared, handle);
        Ok((engine, OfflineOutput::new(scheduler)))
    }

    fn from_parts(
        settings: &EngineSettings,
        format: FrameFormat,
        command_tx: Sender<WorkerCommand>,
        event_rx: Receiver<EngineEvent>,
        shared: Shared,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            format,
            command_tx,
            event_rx,
            rt: shared.rt,
            status: shared.status,
            cancel: shared.cancel,
            device_error: shared.device_error,
            volume: Mutex::new(settings.volume),
            eq_gains: Mutex::new(settings.eq_gains_db),
            crossfade: Mutex::new((settings.crossfade.enabled, settings.crossfade.duration_ms)),
            tap: Mutex::new(Some(shared.tap)),
            worker: Mutex::new(Some(handle)),
        }
    }

    fn send_command(&self, command: WorkerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::EngineShutdown)
    }

    /// Playback commands fail once the output device is gone.
    fn ensure_device(&self) -> Result<()> {
        match self.device_error.lock().as_ref() {
            Some(message) => Err(Error::Device(message.clone())),
            None => Ok(()),
        }
    }

    /// The format every frame is rendered in.
    pub const fn format(&self) -> FrameFormat {
        self.format
    }

    /// Open `source` on a deck and prime it. Blocks until the track is ready
    /// or has failed.
    pub fn load(&self, deck: DeckSelector, source: TrackSource) -> Result<TrackInfo> {
        self.ensure_device()?;
        let (reply, response) = bounded(1);
        self.send_command(WorkerCommand::Load {
            deck,
            source,
            epoch: self.cancel.load(Ordering::Acquire),
            reply,
        })?;
        response.recv().map_err(|_| Error::EngineShutdown)?
    }

    pub fn play(&self) -> Result<()> {
        self.ensure_device()?;
        self.rt.send(RtCommand::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.rt.send(RtCommand::Pause)
    }

    /// Stop playback and rewind. Output is silent from the next frame; a load
    /// in flight is abandoned.
    pub fn stop(&self) -> Result<()> {
        self.cancel.fetch_add(1, Ordering::AcqRel);
        self.rt.send_blocking(RtCommand::Stop)?;
        self.send_command(WorkerCommand::Stop)
    }

    /// Reposition the active deck. Fails without side effects for live
    /// streams and positions past the end.
    pub fn seek(&self, position: Duration) -> Result<()> {
        self.ensure_device()?;
        let (reply, response) = bounded(1);
        self.send_command(WorkerCommand::Seek { position, reply })?;
        response.recv().map_err(|_| Error::EngineShutdown)?
    }

    /// Set the master volume, clamped to 0.0..=1.0.
    pub fn set_volume(&self, level: f32) -> Result<()> {
        if !level.is_finite() {
            return Err(Error::InvalidArgument(format!("volume {level}")));
        }
        let level = level.clamp(0.0, 1.0);
        self.rt.send(RtCommand::SetVolume(level))?;
        *self.volume.lock() = level;
        Ok(())
    }

    /// Set one equalizer band, clamped to the band gain range.
    pub fn set_eq_band(&self, index: usize, gain_db: f32) -> Result<()> {
        if index >= EQ_BAND_COUNT {
            return Err(Error::InvalidArgument(format!(
                "EQ band {index} (there are {EQ_BAND_COUNT})"
            )));
        }
        if !gain_db.is_finite() {
            return Err(Error::InvalidArgument(format!("EQ gain {gain_db} dB")));
        }
        let gain_db = gain_db.clamp(EQ_MIN_GAIN_DB, EQ_MAX_GAIN_DB);
        self.rt.send(RtCommand::SetEqBand { index, gain_db })?;
        self.eq_gains.lock()[index] = gain_db;
        Ok(())
    }

    pub fn set_eq_preset(&self, preset: EqPreset) -> Result<()> {
        let gains = preset.gains();
        self.rt.send(RtCommand::SetEqGains(gains))?;
        *self.eq_gains.lock() = gains;
        Ok(())
    }

    /// Turn crossfading on or off and set its length.
    pub fn enable_crossfade(&self, enabled: bool, duration_ms: u32) -> Result<()> {
        if duration_ms > MAX_CROSSFADE_MS {
            return Err(Error::InvalidArgument(format!(
                "crossfade duration {duration_ms} ms exceeds {MAX_CROSSFADE_MS} ms"
            )));
        }
        self.rt.send(RtCommand::SetCrossfade {
            enabled,
            duration_ms,
        })?;
        *self.crossfade.lock() = (enabled, duration_ms);
        Ok(())
    }

    pub fn set_fade_curve(&self, curve: FadeCurve) -> Result<()> {
        self.rt.send(RtCommand::SetFadeCurve(curve))
    }

    /// Move to the other deck, crossfading if enabled.
    pub fn skip_to_next(&self) -> Result<()> {
        self.ensure_device()?;
        self.rt.send(RtCommand::SkipToNext)
    }

    /// Append a track to the play queue. Queued tracks are loaded into
    /// whichever deck is free.
    pub fn enqueue(&self, source: TrackSource) -> Result<()> {
        self.send_command(WorkerCommand::Enqueue(source))
    }

    pub fn clear_queue(&self) -> Result<()> {
        self.send_command(WorkerCommand::ClearQueue)
    }

    /// Stop, empty both decks and the queue, and return to idle.
    pub fn unload(&self) -> Result<()> {
        self.cancel.fetch_add(1, Ordering::AcqRel);
        self.rt.send_blocking(RtCommand::Stop)?;
        self.rt.send_blocking(RtCommand::Unload)?;
        self.send_command(WorkerCommand::Unload)
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    /// Position of the active track.
    pub fn position(&self) -> Duration {
        self.format
            .samples_to_duration(self.status.position_samples())
    }

    /// Duration of the active track, if known.
    pub fn duration(&self) -> Option<Duration> {
        self.status
            .duration_samples()
            .map(|samples| self.format.samples_to_duration(samples))
    }

    pub fn active_deck(&self) -> DeckId {
        self.status.active_deck()
    }

    pub fn is_crossfading(&self) -> bool {
        self.status.is_fading()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn eq_gains(&self) -> [f32; EQ_BAND_COUNT] {
        *self.eq_gains.lock()
    }

    /// Whether crossfading is enabled, and its length in milliseconds.
    pub fn crossfade(&self) -> (bool, u32) {
        *self.crossfade.lock()
    }

    /// Frames that came up empty since the engine started.
    pub fn underruns(&self) -> u64 {
        self.status.underruns()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive events, blocking until one is available.
    pub fn recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Take the read end of the sample tap: a copy of every rendered sample,
    /// dropped when not read in time. Available once.
    pub fn take_visualizer_tap(&self) -> Option<rtrb::Consumer<f32>> {
        self.tap.lock().take()
    }

    /// Stop the worker thread. Further calls fail with
    /// [`Error::EngineShutdown`].
    pub fn shutdown(&self) -> Result<()> {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        handle
            .join()
            .map_err(|_| Error::Internal("engine worker panicked".to_string()))
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Audio engine shutdown failed: {e}");
        }
    }
}

/// Control context: services facade requests, keeps the deck rings topped
/// up, and turns scheduler events into logs and [`EngineEvent`]s.
struct EngineWorker {
    command_rx: Receiver<WorkerCommand>,
    event_tx: Sender<EngineEvent>,
    rt: RtSender,
    rt_events: rtrb::Consumer<RtEvent>,
    status: Arc<SharedStatus>,
    cancel: Arc<AtomicU64>,
    device_error: Arc<Mutex<Option<String>>>,
    opener: Sender<OpenRequest>,
    opened: Receiver<Opened>,
    format: FrameFormat,
    normalization: NormalizationSettings,
    feeders: [DeckFeeder; 2],
    /// What each deck holds, as far as the worker knows.
    loaded: [Option<TrackInfo>; 2],
    /// Opens in flight, per deck.
    pending: [Option<PendingLoad>; 2],
    queue: VecDeque<TrackSource>,
}

impl EngineWorker {
    fn run(mut self) {
        info!("Audio engine worker started");
        let commands = self.command_rx.clone();
        let mut opened = self.opened.clone();
        let mut opener_gone = false;

        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(WorkerCommand::Shutdown) => {
                        info!("Audio engine shutting down");
                        break;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                },
                recv(opened) -> result => match result {
                    Ok(result) => self.finish_load(result),
                    Err(_) => opener_gone = true,
                },
                default(FILL_INTERVAL) => {}
            }

            if opener_gone {
                error!("Track opener exited; loads will not complete");
                opened = never();
                opener_gone = false;
            }

            self.drain_rt_events();
            self.fill_decks();
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Load {
                deck,
                source,
                epoch,
                reply,
            } => {
                let deck = deck.resolve(self.status.active_deck());
                if self.cancel.load(Ordering::Acquire) == epoch {
                    self.start_load(deck, source, epoch, Some(reply));
                } else {
                    // A stop overtook this request.
                    self.conclude(deck, source, Some(reply), Err(Error::Cancelled));
                }
            }
            WorkerCommand::Seek { position, reply } => {
                let _ = reply.send(self.seek(position));
            }
            WorkerCommand::Stop => {
                self.cancel_requested_loads();
                let active = self.status.active_deck();
                self.rewind(active);
            }
            WorkerCommand::Unload => {
                for deck in DeckId::ALL {
                    self.drop_pending(deck);
                    self.clear_deck(deck);
                }
                self.queue.clear();
                info!("Unloaded");
            }
            WorkerCommand::Enqueue(source) => {
                debug!("Queued {source}");
                self.queue.push_back(source);
                self.advance_queue();
            }
            WorkerCommand::ClearQueue => {
                debug!("Cleared {} queued tracks", self.queue.len());
                self.queue.clear();
            }
            WorkerCommand::DeviceFailed(message) => {
                error!("Audio stream error: {message}");
                *self.device_error.lock() = Some(message.clone());
                self.cancel_requested_loads();
                // The callback may never run again, so the scheduler cannot be
                // relied on to publish this.
                if self.status.state() != PlaybackState::Stopped {
                    self.status.set_state(PlaybackState::Stopped);
                    self.emit(EngineEvent::StateChanged(PlaybackState::Stopped));
                }
                self.emit(EngineEvent::DeviceError(message));
            }
            WorkerCommand::Shutdown => {
                // Handled in the main loop
            }
        }
    }

    /// Announce a load on `deck` and hand the source to the opener. The
    /// outcome arrives in [`EngineWorker::finish_load`].
    fn start_load(
        &mut self,
        deck: DeckId,
        source: TrackSource,
        epoch: u64,
        reply: Option<Sender<Result<TrackInfo>>>,
    ) {
        info!("Loading {source} on deck {deck}");
        let index = deck.index();
        self.drop_pending(deck);
        let generation = self.feeders[index].begin_load();
        self.loaded[index] = None;

        let request = OpenRequest {
            deck,
            generation,
            source: source.clone(),
        };
        let started = self
            .rt
            .send_blocking(RtCommand::DeckLoading { deck, generation })
            .and_then(|()| {
                self.opener
                    .send(request)
                    .map_err(|_| Error::Internal("track opener stopped".to_string()))
            });

        match started {
            Ok(()) => {
                self.pending[index] = Some(PendingLoad {
                    generation,
                    source,
                    epoch,
                    reply,
                });
            }
            Err(e) => {
                let _ = self
                    .rt
                    .send_blocking(RtCommand::DeckLoadFailed { deck, generation });
                self.conclude(deck, source, reply, Err(e));
            }
        }
    }

    /// Install what the opener produced, if the deck still wants it.
    fn finish_load(&mut self, opened: Opened) {
        let Opened {
            deck,
            generation,
            result,
        } = opened;
        let Some(pending) = self.pending[deck.index()].take_if(|p| p.generation == generation)
        else {
            debug!("Deck {deck}: discarding superseded open (generation {generation})");
            return;
        };
        let PendingLoad {
            source,
            epoch,
            reply,
            ..
        } = pending;

        let cancelled = reply.is_some() && self.cancel.load(Ordering::Acquire) != epoch;
        let outcome = match result {
            Ok(_) if cancelled => Err(Error::Cancelled),
            Ok((adapter, handle)) => self.install(deck, generation, adapter, handle),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(info) => self.conclude(deck, source, reply, Ok(info)),
            Err(e) => {
                let next = if reply.is_none() {
                    self.queue.pop_front()
                } else {
                    None
                };
                self.conclude(deck, source, reply, Err(e));
                match next {
                    // The deck goes straight to the next queued track, so the
                    // scheduler never sees it empty in between.
                    Some(next) => {
                        let epoch = self.cancel.load(Ordering::Acquire);
                        self.start_load(deck, next, epoch, None);
                    }
                    None => {
                        let _ = self
                            .rt
                            .send_blocking(RtCommand::DeckLoadFailed { deck, generation });
                    }
                }
            }
        }
        self.advance_queue();
    }

    /// Put an opened track on its deck, prime it, and tell the scheduler.
    fn install(
        &mut self,
        deck: DeckId,
        generation: u64,
        adapter: DecoderAdapter,
        handle: TrackHandle,
    ) -> Result<TrackInfo> {
        let index = deck.index();
        let info = handle.info().clone();
        let feeder = &mut self.feeders[index];
        feeder.install(adapter, handle);
        if let Err(e) = feeder.prime() {
            feeder.begin_load();
            return Err(e);
        }

        let normalization_db = normalization_gain_db(&info.loudness, &self.normalization);
        debug!("Deck {deck}: normalization {normalization_db:+.1} dB");

        self.rt.send_blocking(RtCommand::DeckLoaded {
            deck,
            generation,
            duration: info.duration.map(|d| self.format.duration_to_samples(d)),
            normalization_db: normalization_db as f32,
            seekable: info.seekable,
        })?;
        self.loaded[index] = Some(info.clone());
        Ok(info)
    }

    /// Report a finished load to its caller, or as events for a queued track.
    fn conclude(
        &self,
        deck: DeckId,
        source: TrackSource,
        reply: Option<Sender<Result<TrackInfo>>>,
        outcome: Result<TrackInfo>,
    ) {
        match &outcome {
            Ok(info) => {
                info!(
                    "Deck {deck}: loaded {} ({:?})",
                    info.source, info.duration
                );
                self.emit(EngineEvent::TrackLoaded {
                    deck,
                    info: info.clone(),
                });
            }
            Err(Error::Cancelled) => debug!("Deck {deck}: load of {source} cancelled"),
            Err(e) => warn!("Deck {deck}: failed to load {source}: {e}"),
        }

        match reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    self.emit(EngineEvent::LoadFailed {
                        deck,
                        source,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Forget the open in flight on `deck`; its result is dropped on arrival.
    /// A queued track goes back to the front of the queue.
    fn drop_pending(&mut self, deck: DeckId) {
        let Some(pending) = self.pending[deck.index()].take() else {
            return;
        };
        if pending.reply.is_some() {
            self.conclude(deck, pending.source, pending.reply, Err(Error::Cancelled));
        } else {
            self.queue.push_front(pending.source);
        }
    }

    /// Abandon loads a caller is waiting on. Queued preloads carry on.
    fn cancel_requested_loads(&mut self) {
        for deck in DeckId::ALL {
            let index = deck.index();
            let requested = self.pending[index]
                .as_ref()
                .is_some_and(|pending| pending.reply.is_some());
            if !requested {
                continue;
            }
            if let Some(pending) = self.pending[index].take() {
                let _ = self.rt.send_blocking(RtCommand::DeckLoadFailed {
                    deck,
                    generation: pending.generation,
                });
                self.conclude(deck, pending.source, pending.reply, Err(Error::Cancelled));
            }
        }
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let deck = self.status.active_deck();
        debug!("Deck {deck}: seeking to {position:?}");

        let generation = self.feeders[deck.index()].seek(position).map_err(|e| {
            warn!("Seek failed: {e}");
            e
        })?;
        self.rt.send_blocking(RtCommand::DeckSeeked {
            deck,
            generation,
            position: self.format.duration_to_samples(position),
        })
    }

    /// Put a stopped or finished deck back at the start.
    fn rewind(&mut self, deck: DeckId) {
        let seekable = self.loaded[deck.index()]
            .as_ref()
            .is_some_and(|info| info.seekable);
        if !seekable {
            return;
        }
        match self.feeders[deck.index()].seek(Duration::ZERO) {
            Ok(generation) => {
                let _ = self.rt.send_blocking(RtCommand::DeckSeeked {
                    deck,
                    generation,
                    position: 0,
                });
            }
            Err(e) => warn!("Deck {deck}: rewind failed: {e}"),
        }
    }

    fn clear_deck(&mut self, deck: DeckId) {
        self.loaded[deck.index()] = None;
        let generation = self.feeders[deck.index()].clear();
        if let Err(e) = self
            .rt
            .send_blocking(RtCommand::DeckCleared { deck, generation })
        {
            warn!("Deck {deck}: clear not delivered: {e}");
        }
    }

    /// A deck holding nothing and loading nothing, active deck first.
    fn free_deck(&self) -> Option<DeckId> {
        let active = self.status.active_deck();
        [active, active.other()].into_iter().find(|deck| {
            self.loaded[deck.index()].is_none() && self.pending[deck.index()].is_none()
        })
    }

    /// Start loading queued tracks into free decks.
    fn advance_queue(&mut self) {
        while let Some(deck) = self.free_deck() {
            let Some(source) = self.queue.pop_front() else {
                break;
            };
            let epoch = self.cancel.load(Ordering::Acquire);
            self.start_load(deck, source, epoch, None);
        }
    }

    fn fill_decks(&mut self) {
        for deck in DeckId::ALL {
            if let Err(e) = self.feeders[deck.index()].fill() {
                // The feeder already ended the track.
                if e.ends_track() {
                    self.emit(EngineEvent::DecodeError {
                        deck,
                        error: e.to_string(),
                    });
                } else {
                    error!("Deck {deck}: {e}");
                }
            }
        }
    }

    fn drain_rt_events(&mut self) {
        while let Ok(event) = self.rt_events.pop() {
            self.handle_rt_event(event);
        }
    }

    fn handle_rt_event(&mut self, event: RtEvent) {
        match event {
            RtEvent::StateChanged(state) => {
                info!("State changed: {state:?}");
                self.emit(EngineEvent::StateChanged(state));
            }
            RtEvent::ActiveDeckChanged(deck) => {
                debug!("Active deck: {deck}");
                self.emit(EngineEvent::ActiveDeckChanged(deck));
            }
            RtEvent::DeckReleased(deck) => {
                debug!("Deck {deck} released");
                // A load that already started on the deck replaces what was released.
                if self.pending[deck.index()].is_none() {
                    self.clear_deck(deck);
                }
                self.advance_queue();
            }
            RtEvent::TrackFinished(deck) => {
                info!("Deck {deck}: track finished");
                self.emit(EngineEvent::TrackFinished(deck));
                if self.status.state() == PlaybackState::Stopped
                    && self.status.active_deck() == deck
                {
                    self.rewind(deck);
                }
            }
            RtEvent::Underrun(deck) => warn!("Deck {deck}: buffer underrun"),
            RtEvent::UnderrunRecovered { deck, frames } => {
                debug!("Deck {deck}: recovered after {frames} silent frames");
            }
            RtEvent::CrossfadeStarted { from, to, samples } => {
                let duration = self.format.samples_to_duration(samples);
                info!("Crossfade {from} -> {to} over {duration:?}");
                self.emit(EngineEvent::CrossfadeStarted { from, to, duration });
            }
            RtEvent::CrossfadeFinished(deck) => {
                debug!("Crossfade finished, deck {deck} active");
                self.emit(EngineEvent::CrossfadeFinished(deck));
            }
            RtEvent::NothingToSkipTo => {
                debug!("Skip requested with nothing queued");
                self.emit(EngineEvent::NothingToSkipTo);
            }
            RtEvent::Fault => {
                error!("Playback faulted after repeated underruns");
                self.emit(EngineEvent::Fault);
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}
