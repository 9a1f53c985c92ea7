//! Per-deck source pipeline.
//!
//! A deck's pipeline is split in two halves around a [`frame_ring`]:
//!
//! - [`DeckFeeder`] lives in the control context. It owns the decoder adapter
//!   and the track handle, and keeps the ring topped up. It may block on I/O.
//! - [`DeckReader`] lives in the real-time context. It only pops frames that
//!   are already decoded and never blocks.
//!
//! Every load and every seek starts a new *generation*. Frames are stamped
//! with the generation they were decoded under, and the reader only plays
//! frames of the generation the scheduler has accepted. Older frames are
//! dropped; newer ones are held until the scheduler learns about them.

use std::time::Duration;

use harmony_core::{DeckId, Error, Frame, FrameFormat, Result};
use tracing::{debug, error};

use crate::adapter::{DecoderAdapter, FrameRead, TrackHandle};
use crate::buffer::{frame_ring, FrameConsumer, FrameProducer, SlotKind, SlotMeta};

/// Create both halves of a deck pipeline with room for `buffer` of audio.
pub fn deck_pipeline(deck: DeckId, format: FrameFormat, buffer: Duration) -> (DeckFeeder, DeckReader) {
    let capacity = format.frames_for(buffer).max(2);
    let (producer, consumer) = frame_ring(capacity, format.samples_per_frame());

    let feeder = DeckFeeder {
        deck,
        format,
        producer,
        generation: 0,
        adapter: None,
        handle: None,
        feed: FeedState::Empty,
        scratch: Frame::silence(&format),
        held: false,
    };
    let reader = DeckReader {
        deck,
        consumer,
        accepted: 0,
    };
    (feeder, reader)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedState {
    /// No track installed.
    Empty,
    /// Decoding into the ring.
    Decoding,
    /// Decoding finished; the end marker still has to be written.
    EndPending,
    /// End marker written.
    Done,
}

/// Control-side half: decodes ahead into the ring.
pub struct DeckFeeder {
    deck: DeckId,
    format: FrameFormat,
    producer: FrameProducer,
    generation: u64,
    adapter: Option<DecoderAdapter>,
    handle: Option<TrackHandle>,
    feed: FeedState,
    /// Decode target. Also holds a frame that did not fit in the ring yet.
    scratch: Frame,
    /// `scratch` holds a decoded frame waiting for a free slot.
    held: bool,
}

impl DeckFeeder {
    pub const fn deck(&self) -> DeckId {
        self.deck
    }

    /// Generation frames are currently stamped with.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The loaded track, if any.
    pub const fn handle(&self) -> Option<&TrackHandle> {
        self.handle.as_ref()
    }

    pub const fn is_loaded(&self) -> bool {
        self.adapter.is_some()
    }

    /// True once the end of the track has been written to the ring.
    pub fn is_finished(&self) -> bool {
        self.feed == FeedState::Done
    }

    /// Free slots in the ring.
    pub fn free(&self) -> usize {
        self.producer.free()
    }

    /// Drop the current track and start a new generation. Returns it.
    ///
    /// Called before opening a new source, so frames of the old track are
    /// invalidated as soon as the scheduler accepts the new generation.
    pub fn begin_load(&mut self) -> u64 {
        self.generation += 1;
        self.adapter = None;
        self.handle = None;
        self.feed = FeedState::Empty;
        self.generation
    }

    /// Install an opened track under the current generation.
    pub fn install(&mut self, adapter: DecoderAdapter, handle: TrackHandle) {
        debug!(
            "Deck {}: installed {} (generation {})",
            self.deck,
            handle.info().source,
            self.generation
        );
        self.adapter = Some(adapter);
        self.handle = Some(handle);
        self.feed = FeedState::Decoding;
        self.held = false;
    }

    /// Unload the deck. Returns the new generation.
    pub fn clear(&mut self) -> u64 {
        self.begin_load()
    }

    /// Fill the ring before the deck becomes audible. Returns frames written.
    pub fn prime(&mut self) -> Result<usize> {
        let written = self.fill()?;
        debug!(
            "Deck {}: primed {} frames ({} buffered)",
            self.deck,
            written,
            self.producer.buffered()
        );
        Ok(written)
    }

    /// Top up the ring. Returns frames written.
    ///
    /// A decode error ends the track: the end marker is written and the error
    /// returned so the caller can report it.
    pub fn fill(&mut self) -> Result<usize> {
        let mut written = 0;

        while self.feed == FeedState::Decoding {
            if self.producer.free() == 0 {
                break;
            }

            // A frame left over from a full ring is written before decoding more.
            if !self.held {
                let Some(adapter) = self.adapter.as_mut() else {
                    self.feed = FeedState::Empty;
                    break;
                };
                match adapter.read_frame(&mut self.scratch) {
                    Ok(FrameRead::Frame) => self.held = true,
                    Ok(FrameRead::EndOfStream) => {
                        self.feed = FeedState::EndPending;
                        break;
                    }
                    Err(e) => {
                        error!("Deck {}: decode failed, ending track: {e}", self.deck);
                        self.feed = FeedState::EndPending;
                        self.write_end_marker();
                        self.update_decode_position();
                        return Err(e);
                    }
                }
            }

            let meta = SlotMeta {
                generation: self.generation,
                position: self.scratch.position,
                kind: SlotKind::Audio,
            };
            if !self.producer.push(meta, self.scratch.samples()) {
                break;
            }
            self.held = false;
            written += 1;
        }

        self.write_end_marker();
        self.update_decode_position();
        Ok(written)
    }

    /// Seek the loaded track and start a new generation. Returns it.
    ///
    /// On error nothing changes: buffered frames stay valid.
    pub fn seek(&mut self, position: Duration) -> Result<u64> {
        let adapter = self.adapter.as_mut().ok_or(Error::NoTrackLoaded)?;
        adapter.seek(position)?;

        self.generation += 1;
        self.feed = FeedState::Decoding;
        self.held = false;
        if let Some(handle) = self.handle.as_mut() {
            handle.set_decode_position(position);
        }
        debug!(
            "Deck {}: seek to {:?} (generation {})",
            self.deck, position, self.generation
        );
        Ok(self.generation)
    }

    fn write_end_marker(&mut self) {
        if self.feed != FeedState::EndPending {
            return;
        }
        let position = self.adapter.as_ref().map_or(0, DecoderAdapter::position);
        let meta = SlotMeta {
            generation: self.generation,
            position,
            kind: SlotKind::EndOfTrack,
        };
        if self.producer.push(meta, &[]) {
            self.feed = FeedState::Done;
        }
    }

    fn update_decode_position(&mut self) {
        if let (Some(adapter), Some(handle)) = (self.adapter.as_ref(), self.handle.as_mut()) {
            handle.set_decode_position(self.format.samples_to_duration(adapter.position()));
        }
    }
}

/// What [`DeckReader::next_frame`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeckRead {
    /// The frame holds audio.
    Audio,
    /// The track ended. The frame is silent.
    EndOfTrack,
    /// Nothing buffered. The frame is silent.
    Underrun,
    /// Only audio of a newer generation is buffered; the scheduler has not
    /// accepted it yet. The frame is silent.
    Waiting,
}

/// Real-time half: pops frames of the accepted generation.
pub struct DeckReader {
    deck: DeckId,
    consumer: FrameConsumer,
    accepted: u64,
}

impl DeckReader {
    pub const fn deck(&self) -> DeckId {
        self.deck
    }

    pub const fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Start playing frames of `generation`; everything older becomes stale.
    pub fn accept(&mut self, generation: u64) {
        self.accepted = generation;
        self.discard_stale();
    }

    /// Drop buffered frames older than the accepted generation.
    pub fn discard_stale(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(meta) = self.consumer.peek() {
            if meta.generation >= self.accepted {
                break;
            }
            self.consumer.skip();
            dropped += 1;
        }
        dropped
    }

    /// True if the next frame is playable audio or the end of the track.
    pub fn has_frame(&mut self) -> bool {
        self.discard_stale();
        self.consumer
            .peek()
            .is_some_and(|meta| meta.generation == self.accepted)
    }

    /// Buffered frames, stale ones included.
    pub fn buffered(&self) -> usize {
        self.consumer.buffered()
    }

    /// Pop the next frame into `frame`. Never blocks.
    pub fn next_frame(&mut self, frame: &mut Frame) -> DeckRead {
        self.discard_stale();

        match self.consumer.peek() {
            Some(meta) if meta.generation == self.accepted => {
                self.consumer.pop_into(frame.samples_mut());
                frame.position = meta.position;
                match meta.kind {
                    SlotKind::Audio => DeckRead::Audio,
                    SlotKind::EndOfTrack => {
                        frame.clear();
                        DeckRead::EndOfTrack
                    }
                }
            }
            Some(_) => {
                frame.clear();
                DeckRead::Waiting
            }
            None => {
                frame.clear();
                DeckRead::Underrun
            }
        }
    }
}
