//! Audio device backend
//!
//! The controller never touches the platform audio host directly: it owns
//! `DeviceStream` handles obtained from an `AudioBackend`. `CpalBackend` is
//! the real implementation; tests substitute an in-memory one.
//!
//! cpal streams are not `Send`, so every stream is built, played and
//! dropped on its own dedicated thread. The handle returned to callers only
//! holds a stop channel and the thread's join handle.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, SupportedStreamConfig,
};

use super::resample::{downmix_to_mono, StreamResampler};

/// Errors that can occur while acquiring or running audio devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("Microphone access was denied: {0}")]
    PermissionDenied(String),
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to start audio stream: {0}")]
    StreamPlayFailed(String),
    #[error("Audio device thread failed: {0}")]
    DeviceThread(String),
}

/// Receives mono samples at the requested capture rate
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Fills an interleaved output buffer; the second argument is the channel count
pub type RenderCallback = Box<dyn FnMut(&mut [f32], u16) + Send + 'static>;

/// Format requested from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamRequest {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }
}

/// An open, running device stream exclusively owned by its holder.
pub trait DeviceStream: Send + Sync {
    /// Rate of the samples exchanged with the callback
    fn sample_rate(&self) -> u32;

    /// Channel count of the samples exchanged with the callback
    fn channels(&self) -> u16;

    /// Stop the stream and release the device. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Source of capture and playback streams
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the microphone. The callback receives mono samples at
    /// `request.sample_rate`, whatever the hardware runs at.
    fn open_input(
        &self,
        request: StreamRequest,
        on_samples: InputCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;

    /// Open the speakers. The render callback is driven at the rate and
    /// channel count reported by the returned stream.
    fn open_output(
        &self,
        request: StreamRequest,
        render: RenderCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;
}

/// Default-host cpal backend
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        request: StreamRequest,
        on_samples: InputCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        let stream = spawn_stream_thread("audio-capture", move || build_input(request, on_samples))?;
        Ok(Box::new(stream))
    }

    fn open_output(
        &self,
        request: StreamRequest,
        render: RenderCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        let stream = spawn_stream_thread("audio-playback", move || build_output(request, render))?;
        Ok(Box::new(stream))
    }
}

/// Handle to a cpal stream living on its own thread
struct ThreadedStream {
    sample_rate: u32,
    channels: u16,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceStream for ThreadedStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn close(&mut self) -> Result<(), AudioError> {
        if let Some(tx) = self.stop_tx.take() {
            // The thread may already be gone; dropping the sender wakes it either way
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::DeviceThread("audio thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for ThreadedStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Audio stream close on drop failed: {}", e);
        }
    }
}

/// Build a stream on a new thread and keep it alive until `close()`.
///
/// The builder reports `(stream, callback_rate, callback_channels)` and the
/// stream must already be playing.
fn spawn_stream_thread<F>(name: &str, build: F) -> Result<ThreadedStream, AudioError>
where
    F: FnOnce() -> Result<(Stream, u32, u16), AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(u32, u16), AudioError>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match build() {
            Ok((stream, rate, channels)) => {
                let _ = ready_tx.send(Ok((rate, channels)));
                // Blocks until close() sends or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })
        .map_err(|e| AudioError::DeviceThread(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok((sample_rate, channels))) => Ok(ThreadedStream {
            sample_rate,
            channels,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(AudioError::DeviceThread(format!("{} exited before reporting", name)))
        }
    }
}

fn build_input(
    request: StreamRequest,
    on_samples: InputCallback,
) -> Result<(Stream, u32, u16), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Capture: using input device {:?}", device.name());

    let supported = choose_config(
        device.supported_input_configs().ok().map(|c| c.collect()),
        request,
    )
    .map_or_else(
        || device.default_input_config().map_err(|_| AudioError::NoSupportedConfig),
        Ok,
    )?;

    log::info!(
        "Capture: device config {} Hz, {} channels, {:?} (delivering {} Hz mono)",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format(),
        request.sample_rate
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, request, on_samples),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, request, on_samples),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, request, on_samples),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayFailed(e.to_string()))?;

    Ok((stream, request.sample_rate, 1))
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    request: StreamRequest,
    mut on_samples: InputCallback,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let device_rate = config.sample_rate.0;
    let device_channels = config.channels;
    let mut resampler = StreamResampler::new(device_rate, request.sample_rate);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                let mono = downmix_to_mono(&floats, device_channels);
                let samples = resampler.process(&mono);
                on_samples(&samples);
            },
            |err| log::error!("Capture: stream error: {}", err),
            None,
        )
        .map_err(|e| map_build_error(e, true))
}

fn build_output(
    request: StreamRequest,
    render: RenderCallback,
) -> Result<(Stream, u32, u16), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Playback: using output device {:?}", device.name());

    let supported = choose_config(
        device.supported_output_configs().ok().map(|c| c.collect()),
        request,
    )
    .map_or_else(
        || device.default_output_config().map_err(|_| AudioError::NoSupportedConfig),
        Ok,
    )?;

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;
    let channels = config.channels;

    log::info!(
        "Playback: device config {} Hz, {} channels, {:?}",
        rate,
        channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, render),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, render),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, render),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayFailed(e.to_string()))?;

    Ok((stream, rate, channels))
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut render: RenderCallback,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                render(&mut scratch, channels);
                for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(value);
                }
            },
            |err| log::error!("Playback: stream error: {}", err),
            None,
        )
        .map_err(|e| map_build_error(e, false))
}

/// Pick a supported configuration running natively at the requested rate,
/// preferring the requested channel count.
fn choose_config(
    ranges: Option<Vec<cpal::SupportedStreamConfigRange>>,
    request: StreamRequest,
) -> Option<SupportedStreamConfig> {
    let ranges = ranges?;
    let rate = SampleRate(request.sample_rate);
    let fits = |r: &&cpal::SupportedStreamConfigRange| {
        r.min_sample_rate() <= rate && rate <= r.max_sample_rate()
    };

    ranges
        .iter()
        .filter(fits)
        .find(|r| r.channels() == request.channels)
        .or_else(|| ranges.iter().find(fits))
        .map(|r| r.clone().with_sample_rate(rate))
}

fn map_build_error(err: BuildStreamError, is_input: bool) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable if is_input => AudioError::NoInputDevice,
        BuildStreamError::DeviceNotAvailable => AudioError::NoOutputDevice,
        BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
        BuildStreamError::BackendSpecific { err } => {
            let description = err.description;
            let lower = description.to_lowercase();
            if is_input && (lower.contains("permission") || lower.contains("denied")) {
                AudioError::PermissionDenied(description)
            } else {
                AudioError::StreamCreationFailed(description)
            }
        }
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory backend for unit tests

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct NullStream {
        pub rate: u32,
        pub channels: u16,
        pub closed: Arc<Mutex<u32>>,
    }

    impl DeviceStream for NullStream {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn close(&mut self) -> Result<(), AudioError> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Keeps the callbacks so tests can drive them by hand
    #[derive(Default)]
    pub struct ManualBackend {
        pub input: Mutex<Option<InputCallback>>,
        pub render: Mutex<Option<RenderCallback>>,
        pub output_rate: Option<u32>,
    }

    impl ManualBackend {
        pub fn feed(&self, samples: &[f32]) {
            if let Some(cb) = self.input.lock().unwrap().as_mut() {
                cb(samples);
            }
        }
    }

    impl AudioBackend for ManualBackend {
        fn open_input(
            &self,
            request: StreamRequest,
            on_samples: InputCallback,
        ) -> Result<Box<dyn DeviceStream>, AudioError> {
            *self.input.lock().unwrap() = Some(on_samples);
            Ok(Box::new(NullStream {
                rate: request.sample_rate,
                channels: 1,
                ..Default::default()
            }))
        }

        fn open_output(
            &self,
            request: StreamRequest,
            render: RenderCallback,
        ) -> Result<Box<dyn DeviceStream>, AudioError> {
            *self.render.lock().unwrap() = Some(render);
            Ok(Box::new(NullStream {
                rate: self.output_rate.unwrap_or(request.sample_rate),
                channels: request.channels,
                ..Default::default()
            }))
        }
    }
}
