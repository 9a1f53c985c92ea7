//! Decoder adapter: turns a pluggable decode capability into fixed-size frames
//! in the engine's format.
//!
//! Backends yield packets of any size at the source's native rate and channel
//! count. The adapter maps channels, resamples, and re-chunks, so nothing
//! downstream ever sees a foreign layout.

use std::collections::VecDeque;
use std::time::Duration;

use harmony_core::{Error, Frame, FrameFormat, Result, TrackInfo, TrackLoudness, TrackSource};
use tracing::debug;

use crate::decode::SymphoniaBackend;
use crate::resample::Resampler;
use crate::tone::ToneBackend;

/// An opened source producing interleaved `f32` packets.
pub trait DecodedStream: Send {
    /// Native sample rate.
    fn sample_rate(&self) -> u32;

    /// Native channel count.
    fn channels(&self) -> u16;

    /// Total duration, if known.
    fn duration(&self) -> Option<Duration>;

    /// Whether [`DecodedStream::seek`] can succeed.
    fn is_seekable(&self) -> bool;

    /// Loudness metadata carried by the source.
    fn loudness(&self) -> TrackLoudness {
        TrackLoudness::default()
    }

    /// Decode the next packet. `Ok(None)` marks the end of the stream.
    fn next_packet(&mut self) -> Result<Option<Vec<f32>>>;

    /// Reposition to `position` from the start.
    fn seek(&mut self, position: Duration) -> Result<()>;
}

/// The external decode capability: opens sources of the kinds it understands.
pub trait DecodeBackend: Send + Sync {
    fn open(&self, source: &TrackSource) -> Result<Box<dyn DecodedStream>>;
}

/// Dispatches tones to the generator and everything else to symphonia.
#[derive(Debug, Default)]
pub struct SourceRouter {
    media: SymphoniaBackend,
    tones: ToneBackend,
}

impl DecodeBackend for SourceRouter {
    fn open(&self, source: &TrackSource) -> Result<Box<dyn DecodedStream>> {
        match source {
            TrackSource::Tone { .. } => self.tones.open(source),
            TrackSource::File(_) | TrackSource::Stream(_) => self.media.open(source),
        }
    }
}

/// Result of a frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    /// The frame was filled.
    Frame,
    /// No more audio; the frame is untouched.
    EndOfStream,
}

/// A loaded track: what it is and how far it has been decoded.
#[derive(Debug, Clone)]
pub struct TrackHandle {
    info: TrackInfo,
    decoded: Duration,
}

impl TrackHandle {
    pub const fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub const fn duration(&self) -> Option<Duration> {
        self.info.duration
    }

    /// How far the decoder has got (ahead of what is audible).
    pub const fn decode_position(&self) -> Duration {
        self.decoded
    }

    pub(crate) fn set_decode_position(&mut self, position: Duration) {
        self.decoded = position;
    }
}

/// Uniform frame producer over any [`DecodedStream`].
pub struct DecoderAdapter {
    stream: Box<dyn DecodedStream>,
    format: FrameFormat,
    source_channels: u16,
    seekable: bool,
    duration: Option<Duration>,
    resampler: Option<Resampler>,
    /// Converted samples not yet handed out.
    pending: VecDeque<f32>,
    /// Per-channel samples emitted so far.
    position: u64,
    /// The stream returned end-of-stream and the resampler was flushed.
    exhausted: bool,
}

impl DecoderAdapter {
    /// Open `source` through `backend`.
    ///
    /// May block on file or network I/O; never call from the output thread.
    pub fn open(
        backend: &dyn DecodeBackend,
        source: &TrackSource,
        format: FrameFormat,
    ) -> Result<(Self, TrackHandle)> {
        let stream = backend.open(source)?;

        let source_rate = stream.sample_rate();
        let source_channels = stream.channels();
        if source_rate == 0 || source_channels == 0 {
            return Err(Error::UnsupportedFormat(format!(
                "{source}: {source_rate} Hz, {source_channels} channels"
            )));
        }

        let resampler = if source_rate == format.sample_rate {
            None
        } else {
            Some(Resampler::new(
                source_rate,
                format.sample_rate,
                usize::from(format.channels),
            )?)
        };

        let info = TrackInfo {
            source: source.clone(),
            duration: stream.duration(),
            seekable: stream.is_seekable(),
            source_sample_rate: source_rate,
            source_channels,
            loudness: stream.loudness(),
        };

        debug!(
            "Opened {}: {} Hz, {} ch, duration {:?}, seekable {}",
            source, source_rate, source_channels, info.duration, info.seekable
        );

        let adapter = Self {
            stream,
            format,
            source_channels,
            seekable: info.seekable,
            duration: info.duration,
            resampler,
            pending: VecDeque::with_capacity(format.samples_per_frame() * 4),
            position: 0,
            exhausted: false,
        };

        let handle = TrackHandle {
            info,
            decoded: Duration::ZERO,
        };

        Ok((adapter, handle))
    }

    /// The engine format this adapter produces.
    pub const fn format(&self) -> FrameFormat {
        self.format
    }

    /// Per-channel samples emitted so far.
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Fill `frame` with the next block of audio.
    ///
    /// The last frame of a track is zero-padded. After that every call returns
    /// [`FrameRead::EndOfStream`].
    pub fn read_frame(&mut self, frame: &mut Frame) -> Result<FrameRead> {
        let wanted = self.format.samples_per_frame();

        while self.pending.len() < wanted && !self.exhausted {
            match self.stream.next_packet()? {
                Some(packet) => {
                    let mapped = map_channels(
                        packet,
                        usize::from(self.source_channels),
                        usize::from(self.format.channels),
                    );
                    match self.resampler.as_mut() {
                        Some(resampler) => self.pending.extend(resampler.process(&mapped)?),
                        None => self.pending.extend(mapped),
                    }
                }
                None => {
                    if let Some(resampler) = self.resampler.as_mut() {
                        self.pending.extend(resampler.flush()?);
                    }
                    self.exhausted = true;
                }
            }
        }

        if self.pending.is_empty() {
            return Ok(FrameRead::EndOfStream);
        }

        let take = self.pending.len().min(wanted);
        let out = frame.samples_mut();
        for (dst, src) in out.iter_mut().zip(self.pending.drain(..take)) {
            *dst = src;
        }
        out[take..].fill(0.0);

        frame.position = self.position;
        self.position += self.format.frame_len as u64;
        Ok(FrameRead::Frame)
    }

    /// Reposition the decoder. Live streams always fail with
    /// [`Error::SeekUnsupported`]; positions past a known duration fail with
    /// [`Error::SeekOutOfBounds`].
    pub fn seek(&mut self, position: Duration) -> Result<()> {
        if !self.seekable {
            return Err(Error::SeekUnsupported);
        }
        if let Some(duration) = self.duration {
            if position > duration {
                return Err(Error::SeekOutOfBounds {
                    requested: position,
                    duration,
                });
            }
        }

        self.stream.seek(position)?;
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.exhausted = false;
        self.position = self.format.duration_to_samples(position);
        Ok(())
    }
}

/// Convert interleaved audio between channel counts.
///
/// Mono is duplicated to every output channel, anything folded to mono is
/// averaged, and other layouts keep their leading channels (zero-filling any
/// extra output channels).
fn map_channels(input: Vec<f32>, from: usize, to: usize) -> Vec<f32> {
    if from == to {
        return input;
    }

    let frames = input.len() / from;
    let mut output = Vec::with_capacity(frames * to);

    for frame in input.chunks_exact(from) {
        if from == 1 {
            output.extend(std::iter::repeat(frame[0]).take(to));
        } else if to == 1 {
            output.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for channel in 0..to {
                output.push(frame.get(channel).copied().unwrap_or(0.0));
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    /// Emits `total` mono samples counting up from 1, in packets of `packet`.
    struct Counter {
        rate: u32,
        total: usize,
        packet: usize,
        emitted: usize,
        seekable: bool,
    }

    impl DecodedStream for Counter {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn channels(&self) -> u16 {
            1
        }
        fn duration(&self) -> Option<Duration> {
            Some(Duration::from_secs_f64(self.total as f64 / f64::from(self.rate)))
        }
        fn is_seekable(&self) -> bool {
            self.seekable
        }
        fn next_packet(&mut self) -> Result<Option<Vec<f32>>> {
            if self.emitted >= self.total {
                return Ok(None);
            }
            let end = (self.emitted + self.packet).min(self.total);
            let packet = (self.emitted..end).map(|i| (i + 1) as f32).collect();
            self.emitted = end;
            Ok(Some(packet))
        }
        fn seek(&mut self, position: Duration) -> Result<()> {
            self.emitted = (position.as_secs_f64() * f64::from(self.rate)) as usize;
            Ok(())
        }
    }

    struct CounterBackend {
        seekable: bool,
    }

    impl DecodeBackend for CounterBackend {
        fn open(&self, _source: &TrackSource) -> Result<Box<dyn DecodedStream>> {
            Ok(Box::new(Counter {
                rate: 1000,
                total: 25,
                packet: 7,
                emitted: 0,
                seekable: self.seekable,
            }))
        }
    }

    fn format() -> FrameFormat {
        FrameFormat::new(1000, 2, 10).unwrap()
    }

    fn source() -> TrackSource {
        TrackSource::parse("/music/counter.wav").unwrap()
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_rechunks_and_maps_mono_to_stereo() {
        let backend = CounterBackend { seekable: true };
        let (mut adapter, handle) = DecoderAdapter::open(&backend, &source(), format()).unwrap();
        assert_eq!(handle.duration(), Some(Duration::from_millis(25)));

        let mut frame = Frame::silence(&format());
        assert_eq!(adapter.read_frame(&mut frame).unwrap(), FrameRead::Frame);
        assert_eq!(frame.position, 0);
        assert_eq!(&frame.samples()[..4], &[1.0, 1.0, 2.0, 2.0]);

        assert_eq!(adapter.read_frame(&mut frame).unwrap(), FrameRead::Frame);
        assert_eq!(frame.position, 10);
        assert_eq!(frame.samples()[0], 11.0);

        // 25 samples: the third frame holds 5 and is zero-padded.
        assert_eq!(adapter.read_frame(&mut frame).unwrap(), FrameRead::Frame);
        assert_eq!(frame.samples()[8], 25.0);
        assert!(frame.samples()[10..].iter().all(|s| *s == 0.0));

        assert_eq!(adapter.read_frame(&mut frame).unwrap(), FrameRead::EndOfStream);
        assert_eq!(adapter.read_frame(&mut frame).unwrap(), FrameRead::EndOfStream);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_seek_repositions() {
        let backend = CounterBackend { seekable: true };
        let (mut adapter, _) = DecoderAdapter::open(&backend, &source(), format()).unwrap();
        let mut frame = Frame::silence(&format());
        adapter.read_frame(&mut frame).unwrap();

        adapter.seek(Duration::from_millis(20)).unwrap();
        assert_eq!(adapter.position(), 20);
        adapter.read_frame(&mut frame).unwrap();
        assert_eq!(frame.position, 20);
        assert_eq!(frame.samples()[0], 21.0);
    }

    #[test]
    fn test_seek_errors() {
        let backend = CounterBackend { seekable: true };
        let (mut adapter, _) = DecoderAdapter::open(&backend, &source(), format()).unwrap();
        assert!(matches!(
            adapter.seek(Duration::from_secs(1)),
            Err(Error::SeekOutOfBounds { .. })
        ));

        let backend = CounterBackend { seekable: false };
        let (mut adapter, _) = DecoderAdapter::open(&backend, &source(), format()).unwrap();
        assert!(matches!(
            adapter.seek(Duration::ZERO),
            Err(Error::SeekUnsupported)
        ));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_channel_mapping() {
        assert_eq!(map_channels(vec![1.0, 3.0, 5.0, 7.0], 2, 1), vec![2.0, 6.0]);
        assert_eq!(map_channels(vec![0.5], 1, 3), vec![0.5, 0.5, 0.5]);
        assert_eq!(
            map_channels(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2),
            vec![1.0, 2.0, 4.0, 5.0]
        );
        assert_eq!(map_channels(vec![1.0, 2.0], 2, 4), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_resamples_to_engine_rate() {
        let format = FrameFormat::new(48_000, 2, 480).unwrap();
        let tone = TrackSource::Tone {
            frequency_hz: 440.0,
            duration: Duration::from_millis(500),
        };
        let backend = crate::tone::ToneBackend::with_sample_rate(44_100);
        let (mut adapter, handle) = DecoderAdapter::open(&backend, &tone, format).unwrap();
        assert_eq!(handle.info().source_sample_rate, 44_100);

        let mut frame = Frame::silence(&format);
        let mut frames = 0;
        while adapter.read_frame(&mut frame).unwrap() == FrameRead::Frame {
            frames += 1;
        }
        // 500 ms at 48 kHz is 50 frames of 480; allow for resampler latency.
        assert!((49..=53).contains(&frames), "got {frames} frames");
    }
}
