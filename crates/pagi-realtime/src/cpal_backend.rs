//! Default input and output devices via cpal.

use crate::audio::{f32_to_pcm16, AudioFormat};
use crate::capture::{CaptureDevice, SampleSink};
use crate::error::{RealtimeError, RealtimeResult};
use crate::playback::{PlaybackDevice, PlaybackSource};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use tracing::{info, warn};

fn stream_config(format: &AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Microphone capture on the default input device
#[derive(Default)]
pub struct CpalCapture {
    device: Option<(Device, StreamConfig)>,
    stream: Option<Stream>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// List available input devices
    pub fn list_input_devices() -> RealtimeResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl CaptureDevice for CpalCapture {
    fn open(&mut self, format: &AudioFormat) -> RealtimeResult<()> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| RealtimeError::DeviceUnavailable("No input device available".to_string()))?;

        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));
        let default_config = device.default_input_config()?;
        info!("🔧 Default input config: {:?}", default_config);

        self.device = Some((device, stream_config(format)));
        Ok(())
    }

    fn start(&mut self, mut sink: SampleSink) -> RealtimeResult<()> {
        let (device, config) = self
            .device
            .as_ref()
            .ok_or_else(|| RealtimeError::InvalidState("input device is not open".to_string()))?;

        let stream = device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                sink(&f32_to_pcm16(data));
            },
            move |err| {
                warn!("Audio input stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> RealtimeResult<()> {
        if let Some(stream) = self.stream.take() {
            stream.pause()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.device = None;
    }
}

/// Speaker output on the default output device
#[derive(Default)]
pub struct CpalPlayback {
    stream: Option<Stream>,
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlaybackDevice for CpalPlayback {
    fn open(&mut self, format: &AudioFormat, source: PlaybackSource) -> RealtimeResult<()> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| RealtimeError::DeviceUnavailable("No output device available".to_string()))?;
        info!("🔈 Using output device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let mut scratch: Vec<i16> = Vec::new();
        let stream = device.build_output_stream(
            &stream_config(format),
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                scratch.resize(out.len(), 0);
                source.fill(&mut scratch);
                for (slot, &sample) in out.iter_mut().zip(scratch.iter()) {
                    *slot = sample as f32 / i16::MAX as f32;
                }
            },
            move |err| {
                warn!("Audio output stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Output stream pause failed: {}", e);
            }
        }
    }
}
