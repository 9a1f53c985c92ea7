//! Audio output using cpal, plus an offline renderer with the same pull model.

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, StreamError,
};
use harmony_core::{Error, Frame, FrameFormat, Result};
use tracing::{debug, info};

use crate::scheduler::PlaybackScheduler;

/// Hands out scheduler frames in whatever slice sizes the caller asks for.
///
/// Device callbacks rarely line up with frame boundaries, so the unread tail
/// of the last rendered frame is kept for the next call.
struct FrameCursor {
    scheduler: PlaybackScheduler,
    frame: Frame,
    cursor: usize,
}

impl FrameCursor {
    fn new(scheduler: PlaybackScheduler) -> Self {
        let frame = Frame::silence(&scheduler.format());
        let cursor = frame.samples().len();
        Self {
            scheduler,
            frame,
            cursor,
        }
    }

    fn fill<T: Sample + FromSample<f32>>(&mut self, data: &mut [T]) {
        let mut written = 0;
        while written < data.len() {
            if self.cursor == self.frame.samples().len() {
                self.scheduler.render(&mut self.frame);
                self.cursor = 0;
            }
            let available = &self.frame.samples()[self.cursor..];
            let count = available.len().min(data.len() - written);
            for (out, sample) in data[written..written + count].iter_mut().zip(available) {
                *out = T::from_sample(*sample);
            }
            self.cursor += count;
            written += count;
        }
    }
}

/// An output device that has been opened but not started.
///
/// The engine reads the device's rate and channel count from here to pick its
/// [`FrameFormat`] before building the scheduler.
pub struct OutputDevice {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    name: String,
}

impl OutputDevice {
    /// Open the default output device.
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Device("No output device found".to_string()))?;
        Self::with_device(device)
    }

    /// Open an output device by name.
    pub fn open_named(name: &str) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to list devices: {e}")))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::Device(format!("Output device not found: {name}")))?;
        Self::with_device(device)
    }

    #[allow(clippy::needless_pass_by_value)] // Device is typically moved
    fn with_device(device: Device) -> Result<Self> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::Device(format!("Failed to get output config: {e}")))?;
        debug!("Supported output config: {:?}", supported_config);

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub const fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Frame format matching this device.
    pub fn frame_format(&self, frame_len: usize) -> Result<FrameFormat> {
        FrameFormat::new(self.sample_rate(), self.channels(), frame_len)
    }

    /// Build and start the stream. The scheduler moves into the device
    /// callback; `on_error` runs on cpal's error path, never in the callback.
    pub fn start<E>(self, scheduler: PlaybackScheduler, on_error: E) -> Result<DeviceOutput>
    where
        E: FnMut(StreamError) + Send + 'static,
    {
        let format = scheduler.format();
        if format.sample_rate != self.sample_rate() || format.channels != self.channels() {
            return Err(Error::InvalidArgument(format!(
                "scheduler format {}Hz/{}ch does not match device {}Hz/{}ch",
                format.sample_rate,
                format.channels,
                self.sample_rate(),
                self.channels()
            )));
        }

        let cursor = FrameCursor::new(scheduler);
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream::<f32, E>(cursor, on_error)?,
            SampleFormat::I16 => self.build_stream::<i16, E>(cursor, on_error)?,
            SampleFormat::U16 => self.build_stream::<u16, E>(cursor, on_error)?,
            SampleFormat::I32 => self.build_stream::<i32, E>(cursor, on_error)?,
            sample_format => {
                return Err(Error::Device(format!(
                    "Unsupported sample format: {sample_format:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::Device(format!("Failed to start stream: {e}")))?;

        info!(
            "Audio output started: {} ({} Hz, {} channels)",
            self.name,
            self.sample_rate(),
            self.channels()
        );

        Ok(DeviceOutput {
            _stream: stream,
            name: self.name,
            sample_rate: self.config.sample_rate.0,
            channels: self.config.channels,
        })
    }

    fn build_stream<T, E>(&self, mut cursor: FrameCursor, on_error: E) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
        E: FnMut(StreamError) + Send + 'static,
    {
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| cursor.fill(data),
                on_error,
                None,
            )
            .map_err(|e| Error::Device(format!("Failed to build stream: {e}")))
    }
}

/// A running device stream. Dropping it stops output.
pub struct DeviceOutput {
    _stream: Stream,
    name: String,
    sample_rate: u32,
    channels: u16,
}

impl DeviceOutput {
    pub fn device_name(&self) -> &str {
        &self.name
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }
}

/// Drives the scheduler by hand instead of from a device callback.
///
/// Used by tests and for rendering to memory.
pub struct OfflineOutput {
    cursor: FrameCursor,
}

impl OfflineOutput {
    pub fn new(scheduler: PlaybackScheduler) -> Self {
        Self {
            cursor: FrameCursor::new(scheduler),
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.cursor.scheduler.format()
    }

    pub const fn scheduler(&self) -> &PlaybackScheduler {
        &self.cursor.scheduler
    }

    /// Render the next whole frame.
    ///
    /// Samples left over from a previous partial [`render`](Self::render) are
    /// dropped.
    pub fn render_frame(&mut self) -> &Frame {
        self.cursor.scheduler.render(&mut self.cursor.frame);
        self.cursor.cursor = self.cursor.frame.samples().len();
        &self.cursor.frame
    }

    /// Fill `out` with interleaved samples, as a device callback would.
    pub fn render(&mut self, out: &mut [f32]) {
        self.cursor.fill(out);
    }
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Device(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}
