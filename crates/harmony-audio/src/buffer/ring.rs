//! Lock-free ring buffer of fixed-size audio frames.
//!
//! Single producer (the decode thread) and single consumer (the output
//! callback). Each slot holds one frame of interleaved samples plus a small
//! header describing which load/seek generation it belongs to, so the
//! consumer can drop stale audio without the producer touching its cursor.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// One frame of audio.
    Audio,
    /// Marker: the track ended (naturally or on a decode error). No samples.
    EndOfTrack,
}

/// Header stored next to each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    /// Load/seek generation the frame was decoded under.
    pub generation: u64,
    /// Position of the first sample, per-channel samples from track start.
    pub position: u64,
    pub kind: SlotKind,
}

impl SlotMeta {
    const EMPTY: Self = Self {
        generation: 0,
        position: 0,
        kind: SlotKind::Audio,
    };
}

struct FrameRing {
    /// Sample storage, `capacity * frame_samples` long.
    samples: Box<[UnsafeCell<f32>]>,
    /// One header per slot.
    meta: Box<[UnsafeCell<SlotMeta>]>,
    /// Next slot to read (monotonic).
    read_pos: AtomicUsize,
    /// Next slot to write (monotonic).
    write_pos: AtomicUsize,
    /// Slot count, exactly as requested.
    capacity: usize,
    /// Interleaved samples per frame.
    frame_samples: usize,
}

// SAFETY: slots are only written by the single producer while they are outside
// the readable range, and only read by the single consumer while inside it.
// The cursors are published with release/acquire ordering, so a slot's
// contents are visible before its index becomes readable (and vice versa).
#[allow(unsafe_code)]
unsafe impl Sync for FrameRing {}

impl FrameRing {
    fn buffered(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    const fn slot(&self, pos: usize) -> usize {
        pos % self.capacity
    }
}

/// Create a ring holding `capacity_frames` frames of `frame_samples` samples.
///
/// The ring holds exactly `capacity_frames` slots (at least one).
pub fn frame_ring(capacity_frames: usize, frame_samples: usize) -> (FrameProducer, FrameConsumer) {
    let capacity = capacity_frames.max(1);
    let samples = (0..capacity * frame_samples)
        .map(|_| UnsafeCell::new(0.0f32))
        .collect();
    let meta = (0..capacity)
        .map(|_| UnsafeCell::new(SlotMeta::EMPTY))
        .collect();

    let ring = Arc::new(FrameRing {
        samples,
        meta,
        read_pos: AtomicUsize::new(0),
        write_pos: AtomicUsize::new(0),
        capacity,
        frame_samples,
    });

    (
        FrameProducer { ring: ring.clone() },
        FrameConsumer { ring },
    )
}

/// Write end of a frame ring. Owned by the decode thread.
pub struct FrameProducer {
    ring: Arc<FrameRing>,
}

impl FrameProducer {
    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Slots currently holding unread frames (stale ones included).
    pub fn buffered(&self) -> usize {
        self.ring.buffered()
    }

    /// Slots free for writing.
    pub fn free(&self) -> usize {
        self.ring.capacity - self.ring.buffered()
    }

    /// Append one slot. `samples` is ignored for [`SlotKind::EndOfTrack`] and
    /// must be exactly one frame long otherwise.
    ///
    /// Returns false if the ring is full or the frame has the wrong length.
    pub fn push(&mut self, meta: SlotMeta, samples: &[f32]) -> bool {
        let ring = &*self.ring;
        if meta.kind == SlotKind::Audio && samples.len() != ring.frame_samples {
            return false;
        }

        let write_pos = ring.write_pos.load(Ordering::Relaxed);
        let read_pos = ring.read_pos.load(Ordering::Acquire);
        if write_pos.wrapping_sub(read_pos) >= ring.capacity {
            return false;
        }

        let slot = ring.slot(write_pos);

        // SAFETY: we are the only producer and `slot` is outside the readable
        // range until `write_pos` is published below.
        #[allow(unsafe_code)]
        unsafe {
            if meta.kind == SlotKind::Audio {
                let base = UnsafeCell::raw_get(ring.samples.as_ptr());
                std::ptr::copy_nonoverlapping(
                    samples.as_ptr(),
                    base.add(slot * ring.frame_samples),
                    ring.frame_samples,
                );
            }
            *ring.meta[slot].get() = meta;
        }

        ring.write_pos
            .store(write_pos.wrapping_add(1), Ordering::Release);
        true
    }
}

/// Read end of a frame ring. Owned by the real-time thread.
pub struct FrameConsumer {
    ring: Arc<FrameRing>,
}

impl FrameConsumer {
    /// Slots currently holding unread frames.
    pub fn buffered(&self) -> usize {
        self.ring.buffered()
    }

    /// True if nothing is readable.
    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Header of the oldest unread slot.
    pub fn peek(&self) -> Option<SlotMeta> {
        let ring = &*self.ring;
        let read_pos = ring.read_pos.load(Ordering::Relaxed);
        let write_pos = ring.write_pos.load(Ordering::Acquire);
        if write_pos == read_pos {
            return None;
        }

        // SAFETY: the slot is inside the readable range, which the producer
        // does not touch until we advance `read_pos`.
        #[allow(unsafe_code)]
        let meta = unsafe { *ring.meta[ring.slot(read_pos)].get() };
        Some(meta)
    }

    /// Pop the oldest slot, copying its samples into `output` when it holds
    /// audio. `output` must be exactly one frame long.
    pub fn pop_into(&mut self, output: &mut [f32]) -> Option<SlotMeta> {
        let ring = &*self.ring;
        debug_assert_eq!(output.len(), ring.frame_samples);

        let meta = self.peek()?;
        let read_pos = ring.read_pos.load(Ordering::Relaxed);

        if meta.kind == SlotKind::Audio && output.len() == ring.frame_samples {
            let slot = ring.slot(read_pos);
            // SAFETY: as in `peek`; lengths checked above.
            #[allow(unsafe_code)]
            unsafe {
                let base = UnsafeCell::raw_get(ring.samples.as_ptr());
                std::ptr::copy_nonoverlapping(
                    base.add(slot * ring.frame_samples),
                    output.as_mut_ptr(),
                    ring.frame_samples,
                );
            }
        }

        ring.read_pos
            .store(read_pos.wrapping_add(1), Ordering::Release);
        Some(meta)
    }

    /// Drop the oldest slot without reading it.
    pub fn skip(&mut self) -> bool {
        let ring = &*self.ring;
        let read_pos = ring.read_pos.load(Ordering::Relaxed);
        let write_pos = ring.write_pos.load(Ordering::Acquire);
        if write_pos == read_pos {
            return false;
        }
        ring.read_pos
            .store(read_pos.wrapping_add(1), Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    fn audio(generation: u64, position: u64) -> SlotMeta {
        SlotMeta {
            generation,
            position,
            kind: SlotKind::Audio,
        }
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_push_pop() {
        let (mut tx, mut rx) = frame_ring(4, 3);

        assert!(tx.push(audio(1, 0), &[1.0, 2.0, 3.0]));
        assert_eq!(rx.buffered(), 1);

        let mut out = [0.0f32; 3];
        let meta = rx.pop_into(&mut out).unwrap();
        assert_eq!(meta, audio(1, 0));
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert!(rx.is_empty());
        assert!(rx.pop_into(&mut out).is_none());
    }

    #[test]
    fn test_full_ring_rejects() {
        let (mut tx, mut rx) = frame_ring(2, 1);
        assert_eq!(tx.capacity(), 2);
        assert!(tx.push(audio(0, 0), &[0.1]));
        assert!(tx.push(audio(0, 1), &[0.2]));
        assert!(!tx.push(audio(0, 2), &[0.3]));
        assert_eq!(tx.free(), 0);

        assert!(rx.skip());
        assert!(tx.push(audio(0, 2), &[0.3]));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_capacity_is_exact() {
        let (mut tx, mut rx) = frame_ring(20, 1);
        assert_eq!(tx.capacity(), 20);
        for i in 0..20u64 {
            assert!(tx.push(audio(0, i), &[i as f32]));
        }
        assert!(!tx.push(audio(0, 20), &[20.0]));

        // Wrap around a non power-of-two capacity several times.
        let mut out = [0.0f32; 1];
        for i in 20..100u64 {
            let meta = rx.pop_into(&mut out).unwrap();
            assert_eq!(meta.position, i - 20);
            assert_eq!(out[0], (i - 20) as f32);
            assert!(tx.push(audio(0, i), &[i as f32]));
        }
        assert_eq!(rx.buffered(), 20);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let (mut tx, _rx) = frame_ring(2, 4);
        assert!(!tx.push(audio(0, 0), &[0.0; 3]));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_end_marker_leaves_output_untouched() {
        let (mut tx, mut rx) = frame_ring(4, 2);
        let end = SlotMeta {
            generation: 3,
            position: 96,
            kind: SlotKind::EndOfTrack,
        };
        assert!(tx.push(end, &[]));

        let mut out = [7.0f32; 2];
        assert_eq!(rx.peek(), Some(end));
        assert_eq!(rx.pop_into(&mut out), Some(end));
        assert_eq!(out, [7.0, 7.0]);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_wraparound_keeps_order() {
        let (mut tx, mut rx) = frame_ring(4, 2);
        let mut out = [0.0f32; 2];

        for round in 0..10u64 {
            let value = round as f32;
            assert!(tx.push(audio(0, round), &[value, -value]));
            let meta = rx.pop_into(&mut out).unwrap();
            assert_eq!(meta.position, round);
            assert_eq!(out, [value, -value]);
        }
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let (mut tx, mut rx) = frame_ring(8, 16);

        let writer = thread::spawn(move || {
            let mut next = 0u64;
            while next < 2000 {
                let frame = [next as f32; 16];
                if tx.push(audio(0, next), &frame) {
                    next += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let reader = thread::spawn(move || {
            let mut out = [0.0f32; 16];
            let mut expected = 0u64;
            while expected < 2000 {
                if let Some(meta) = rx.pop_into(&mut out) {
                    assert_eq!(meta.position, expected);
                    assert!(out.iter().all(|s| (*s - expected as f32).abs() < 0.5));
                    expected += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
