//! Audio decoding using symphonia.
//!
//! Local files are opened seekable. HTTP streams are read incrementally
//! through ureq and are never seekable.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use harmony_core::{Error, Result, TrackLoudness, TrackSource};
use parking_lot::Mutex;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions, ReadOnlySource},
    meta::{MetadataOptions, MetadataRevision, StandardTagKey},
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::{debug, warn};

use crate::adapter::{DecodeBackend, DecodedStream};

/// Consecutive undecodable packets tolerated before the track is abandoned.
const MAX_CORRUPT_PACKETS: usize = 8;

/// Opens files and HTTP streams through symphonia's probe.
#[derive(Debug, Default)]
pub struct SymphoniaBackend;

impl DecodeBackend for SymphoniaBackend {
    fn open(&self, source: &TrackSource) -> Result<Box<dyn DecodedStream>> {
        let stream = match source {
            TrackSource::File(path) => open_file(path)?,
            TrackSource::Stream(url) => open_http(url.as_str(), source.extension().as_deref())?,
            TrackSource::Tone { .. } => {
                return Err(Error::UnsupportedFormat(format!(
                    "{source} is not a media source"
                )))
            }
        };
        Ok(Box::new(stream))
    }
}

fn open_file(path: &Path) -> Result<SymphoniaStream> {
    let file = File::open(path)
        .map_err(|e| Error::SourceUnavailable(format!("{}: {e}", path.display())))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    SymphoniaStream::probe(Box::new(file), hint, true)
}

fn open_http(url: &str, extension: Option<&str>) -> Result<SymphoniaStream> {
    debug!("Connecting to stream: {url}");

    let response = ureq::get(url)
        .header("Accept", "audio/*, */*")
        .call()
        .map_err(|e| Error::SourceUnavailable(format!("HTTP request failed: {e}")))?;

    let mut hint = Hint::new();
    let mime = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);
    match mime.as_deref().and_then(extension_for_mime).or(extension) {
        Some(ext) => {
            hint.with_extension(ext);
        }
        None => debug!("No format hint for {url}"),
    }

    let reader = HttpReader(Mutex::new(response.into_body().into_reader()));
    SymphoniaStream::probe(Box::new(ReadOnlySource::new(reader)), hint, false)
}

/// Map a Content-Type to a probe hint.
fn extension_for_mime(mime: &str) -> Option<&'static str> {
    if mime.contains("mpeg") || mime.contains("mp3") {
        Some("mp3")
    } else if mime.contains("aac") {
        Some("aac")
    } else if mime.contains("mp4") || mime.contains("m4a") {
        Some("m4a")
    } else if mime.contains("ogg") || mime.contains("vorbis") || mime.contains("opus") {
        Some("ogg")
    } else if mime.contains("flac") {
        Some("flac")
    } else if mime.contains("wav") || mime.contains("wave") {
        Some("wav")
    } else {
        None
    }
}

/// HTTP body reader. The mutex only exists to make the reader `Sync` for
/// symphonia; it is never contended.
struct HttpReader<R>(Mutex<R>);

impl<R: Read> Read for HttpReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.get_mut().read(buf)
    }
}

/// One opened symphonia track.
pub struct SymphoniaStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    time_base: Option<TimeBase>,
    duration: Option<Duration>,
    seekable: bool,
    loudness: TrackLoudness,
    buffer: Option<SampleBuffer<f32>>,
    /// Per-channel samples to drop after an inexact seek.
    skip: usize,
}

impl SymphoniaStream {
    fn probe(source: Box<dyn MediaSource>, hint: Hint, seekable: bool) -> Result<Self> {
        let mss = MediaSourceStream::new(source, MediaSourceStreamOptions::default());

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to probe format: {e}")))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::UnsupportedFormat("No audio tracks found".to_string()))?;

        let track_id = track.id;
        let params = track.codec_params.clone();
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::UnsupportedFormat("Unknown sample rate".to_string()))?;
        #[allow(clippy::cast_possible_truncation)]
        let channels = params.channels.map_or(2, |c| c.count() as u16);

        let duration = if seekable {
            params.n_frames.and_then(|frames| match params.time_base {
                Some(tb) => Some(time_to_duration(tb.calc_time(frames))),
                None => Some(Duration::from_secs_f64(
                    frames as f64 / f64::from(sample_rate),
                )),
            })
        } else {
            None
        };

        // Container tags win over probe-level (e.g. ID3v2) tags.
        let mut loudness = format
            .metadata()
            .current()
            .map(loudness_from_tags)
            .unwrap_or_default();
        if !loudness.is_known() {
            if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
                loudness = loudness_from_tags(revision);
            }
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to create decoder: {e}")))?;

        debug!(
            "Audio track: id={}, sample_rate={}, channels={}, duration={:?}, replay_gain={:?}",
            track_id, sample_rate, channels, duration, loudness.replay_gain_db
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base: params.time_base,
            duration,
            seekable,
            loudness,
            buffer: None,
            skip: 0,
        })
    }
}

impl DecodedStream for SymphoniaStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn loudness(&self) -> TrackLoudness {
        self.loudness
    }

    fn next_packet(&mut self) -> Result<Option<Vec<f32>>> {
        let mut corrupt = 0;
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {e}"))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    corrupt += 1;
                    warn!("Skipping corrupt packet ({corrupt}/{MAX_CORRUPT_PACKETS}): {e}");
                    if corrupt >= MAX_CORRUPT_PACKETS {
                        return Err(Error::Decode(format!(
                            "{corrupt} consecutive corrupt packets: {e}"
                        )));
                    }
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(Error::Decode(format!("Decode failed: {e}"))),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            let too_small = match &self.buffer {
                Some(buffer) => buffer.capacity() < decoded.capacity() * spec.channels.count(),
                None => true,
            };
            if too_small {
                self.buffer = Some(SampleBuffer::new(capacity, spec));
            }
            let Some(buffer) = self.buffer.as_mut() else {
                continue;
            };
            buffer.copy_interleaved_ref(decoded);

            let channels = spec.channels.count();
            let samples = buffer.samples();
            let skip = (self.skip * channels).min(samples.len());
            self.skip -= skip / channels.max(1);
            if skip == samples.len() {
                continue;
            }
            return Ok(Some(samples[skip..].to_vec()));
        }
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        if !self.seekable {
            return Err(Error::SeekUnsupported);
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(position.as_secs_f64()),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Decode(format!("Seek failed: {e}")))?;

        self.decoder.reset();

        // Accurate seeks may land on the packet before the target.
        self.skip = match self.time_base {
            Some(tb) if seeked.required_ts > seeked.actual_ts => {
                let gap = time_to_duration(tb.calc_time(seeked.required_ts - seeked.actual_ts));
                (gap.as_secs_f64() * f64::from(self.sample_rate)).round() as usize
            }
            _ => 0,
        };

        debug!("Seeked to {:?} (skipping {} samples)", position, self.skip);
        Ok(())
    }
}

fn time_to_duration(time: Time) -> Duration {
    Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac)
}

fn loudness_from_tags(revision: &MetadataRevision) -> TrackLoudness {
    let mut loudness = TrackLoudness::default();
    for tag in revision.tags() {
        match tag.std_key {
            Some(StandardTagKey::ReplayGainTrackGain) => {
                loudness.replay_gain_db = parse_tag_number(&tag.value.to_string());
            }
            Some(StandardTagKey::ReplayGainTrackPeak) => {
                loudness.peak = parse_tag_number(&tag.value.to_string());
            }
            _ => {}
        }
    }
    loudness
}

/// Parse values like `"-6.54 dB"` or `"0.988"`.
fn parse_tag_number(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    let number = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .unwrap_or(trimmed)
        .trim();
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}
