//! Lock-free hand-off between the control context and the real-time context.
//!
//! Commands travel to the scheduler through one `rtrb` queue and are applied
//! at the start of the next rendered frame. Everything on the queue is plain
//! `Copy` data so the real-time side never frees memory. The scheduler talks
//! back through a second queue of [`RtEvent`]s (dropped when full) and a block
//! of atomics that any thread may read.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use harmony_core::{DeckId, Error, FadeCurve, PlaybackState, Result, EQ_BAND_COUNT};
use parking_lot::Mutex;

/// Commands the scheduler can hold before pushes fail.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Events the scheduler can hold before it starts dropping them.
pub const EVENT_QUEUE_CAPACITY: usize = 512;

/// How long the control context waits for room in a full command queue.
const BLOCKING_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Commands applied by the scheduler at a frame boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtCommand {
    /// A new track is being opened on `deck`; frames of older generations
    /// are now stale.
    DeckLoading { deck: DeckId, generation: u64 },
    /// `deck` holds a primed track of `generation`.
    DeckLoaded {
        deck: DeckId,
        generation: u64,
        /// Per-channel samples, if known.
        duration: Option<u64>,
        normalization_db: f32,
        seekable: bool,
    },
    /// Opening the track for `generation` failed.
    DeckLoadFailed { deck: DeckId, generation: u64 },
    /// `deck` was repositioned; frames of `generation` start at `position`.
    DeckSeeked {
        deck: DeckId,
        generation: u64,
        position: u64,
    },
    /// `deck` no longer holds a track.
    DeckCleared { deck: DeckId, generation: u64 },
    Play,
    Pause,
    Stop,
    /// Engine-wide unload, back to idle.
    Unload,
    SetVolume(f32),
    SetEqBand { index: usize, gain_db: f32 },
    SetEqGains([f32; EQ_BAND_COUNT]),
    SetCrossfade { enabled: bool, duration_ms: u32 },
    SetFadeCurve(FadeCurve),
    SkipToNext,
    /// The output device reported a fatal error.
    DeviceFailed,
}

/// Events emitted by the scheduler for the control context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtEvent {
    StateChanged(PlaybackState),
    ActiveDeckChanged(DeckId),
    /// The deck is no longer audible and can take the next track.
    DeckReleased(DeckId),
    /// The deck reached the end of its track.
    TrackFinished(DeckId),
    /// The deck ran dry while audible.
    Underrun(DeckId),
    /// The deck has audio again after `frames` silent frames.
    UnderrunRecovered { deck: DeckId, frames: u32 },
    CrossfadeStarted { from: DeckId, to: DeckId, samples: u64 },
    CrossfadeFinished(DeckId),
    /// A skip was requested but the other deck had nothing to play.
    NothingToSkipTo,
    /// Too many consecutive underruns.
    Fault,
}

/// Create the command queue.
pub fn rt_command_channel() -> (RtSender, rtrb::Consumer<RtCommand>) {
    let (producer, consumer) = rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY);
    (
        RtSender {
            producer: Arc::new(Mutex::new(producer)),
        },
        consumer,
    )
}

/// Create the event queue.
pub fn rt_event_channel() -> (rtrb::Producer<RtEvent>, rtrb::Consumer<RtEvent>) {
    rtrb::RingBuffer::new(EVENT_QUEUE_CAPACITY)
}

/// Shared producer end of the command queue.
///
/// The facade and the control worker both push; the mutex serializes them.
/// The real-time side only owns the consumer and never takes this lock.
#[derive(Clone)]
pub struct RtSender {
    producer: Arc<Mutex<rtrb::Producer<RtCommand>>>,
}

impl RtSender {
    /// Queue a command without waiting.
    pub fn send(&self, command: RtCommand) -> Result<()> {
        self.producer
            .lock()
            .push(command)
            .map_err(|_| Error::CommandQueueFull)
    }

    /// Queue a command, waiting briefly for room. Control context only.
    pub fn send_blocking(&self, command: RtCommand) -> Result<()> {
        let deadline = Instant::now() + BLOCKING_SEND_TIMEOUT;
        loop {
            match self.send(command) {
                Err(Error::CommandQueueFull) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    /// Free slots.
    pub fn slots(&self) -> usize {
        self.producer.lock().slots()
    }
}

const UNKNOWN: u64 = u64::MAX;

/// Scheduler status readable from any thread.
#[derive(Debug)]
pub struct SharedStatus {
    state: AtomicU8,
    active_deck: AtomicU8,
    /// Per-channel samples into the active track.
    position: AtomicU64,
    /// Per-channel samples, [`UNKNOWN`] when not known.
    duration: AtomicU64,
    fading: AtomicBool,
    underruns: AtomicU64,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Idle.as_u8()),
            active_deck: AtomicU8::new(0),
            position: AtomicU64::new(0),
            duration: AtomicU64::new(UNKNOWN),
            fading: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
        }
    }
}

impl SharedStatus {
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn active_deck(&self) -> DeckId {
        DeckId::from_index(usize::from(self.active_deck.load(Ordering::Acquire)))
    }

    pub fn position_samples(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn duration_samples(&self) -> Option<u64> {
        match self.duration.load(Ordering::Relaxed) {
            UNKNOWN => None,
            samples => Some(samples),
        }
    }

    pub fn is_fading(&self) -> bool {
        self.fading.load(Ordering::Relaxed)
    }

    /// Underrun frames since the engine started.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn set_active_deck(&self, deck: DeckId) {
        self.active_deck.store(deck.index() as u8, Ordering::Release);
    }

    pub(crate) fn set_position(&self, samples: u64) {
        self.position.store(samples, Ordering::Relaxed);
    }

    pub(crate) fn set_duration(&self, samples: Option<u64>) {
        self.duration
            .store(samples.unwrap_or(UNKNOWN), Ordering::Relaxed);
    }

    pub(crate) fn set_fading(&self, fading: bool) {
        self.fading.store(fading, Ordering::Relaxed);
    }

    pub(crate) fn add_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_command_round_trip() {
        let (tx, mut rx) = rt_command_channel();
        tx.send(RtCommand::Play).unwrap();
        tx.send(RtCommand::SetVolume(0.5)).unwrap();
        assert_eq!(rx.pop().unwrap(), RtCommand::Play);
        assert_eq!(rx.pop().unwrap(), RtCommand::SetVolume(0.5));
        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_full_queue_is_an_error() {
        let (tx, _rx) = rt_command_channel();
        for _ in 0..COMMAND_QUEUE_CAPACITY {
            tx.send(RtCommand::Pause).unwrap();
        }
        assert!(matches!(
            tx.send(RtCommand::Pause),
            Err(Error::CommandQueueFull)
        ));
        assert!(matches!(
            tx.send_blocking(RtCommand::Pause),
            Err(Error::CommandQueueFull)
        ));
    }

    #[test]
    fn test_status_defaults() {
        let status = SharedStatus::default();
        assert_eq!(status.state(), PlaybackState::Idle);
        assert_eq!(status.active_deck(), DeckId::A);
        assert_eq!(status.duration_samples(), None);

        status.set_duration(Some(480));
        status.set_active_deck(DeckId::B);
        assert_eq!(status.duration_samples(), Some(480));
        assert_eq!(status.active_deck(), DeckId::B);
    }
}
