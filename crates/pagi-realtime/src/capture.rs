//! Audio capture channel: a restartable sequence of fixed-size PCM16 frames.
//!
//! The device layer pushes sample runs of whatever length the hardware hands it;
//! the channel re-chunks them into frames of exactly `frame_samples` samples and
//! delivers each one to the sink supplied to [`AudioCaptureChannel::record`].

use crate::audio::{spectrum, AudioFormat, AudioFrame};
use crate::error::{RealtimeError, RealtimeResult};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Callback a device invokes with every run of captured samples.
/// Runs on the device thread, so it must not block.
pub type SampleSink = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Input device boundary. Implementations: `CpalCapture`, `MockCapture`.
pub trait CaptureDevice {
    /// Acquire the device. Fails with `DeviceUnavailable` when none is present.
    fn open(&mut self, format: &AudioFormat) -> RealtimeResult<()>;

    /// Start pushing samples into `sink` until `stop`.
    fn start(&mut self, sink: SampleSink) -> RealtimeResult<()>;

    /// Stop pushing samples; the device stays open and `start` may be called again.
    fn stop(&mut self) -> RealtimeResult<()>;

    /// Release the device.
    fn close(&mut self);
}

/// Lifecycle of the capture channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Closed,
    Paused,
    Recording,
}

/// Re-chunks arbitrary sample runs into fixed frames.
struct FrameChunker<F> {
    frame_samples: usize,
    buffer: Vec<i16>,
    on_frame: F,
    last_frame: Arc<Mutex<Vec<i16>>>,
}

impl<F: FnMut(AudioFrame)> FrameChunker<F> {
    fn push(&mut self, data: &[i16]) {
        for &sample in data {
            self.buffer.push(sample);

            if self.buffer.len() >= self.frame_samples {
                let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_samples));
                if let Ok(mut last) = self.last_frame.lock() {
                    last.clone_from(&samples);
                }
                (self.on_frame)(AudioFrame {
                    samples,
                    timestamp: Instant::now(),
                });
            }
        }
    }
}

/// Capture side of the session
pub struct AudioCaptureChannel {
    device: Box<dyn CaptureDevice>,
    format: AudioFormat,
    status: CaptureStatus,
    last_frame: Arc<Mutex<Vec<i16>>>,
}

impl AudioCaptureChannel {
    pub fn new(device: Box<dyn CaptureDevice>, format: AudioFormat) -> Self {
        Self {
            device,
            format,
            status: CaptureStatus::Closed,
            last_frame: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Open the device. No-op if already open.
    pub fn begin(&mut self) -> RealtimeResult<()> {
        if self.status != CaptureStatus::Closed {
            return Ok(());
        }
        self.device.open(&self.format)?;
        self.status = CaptureStatus::Paused;
        info!(
            sample_rate = self.format.sample_rate,
            frame_samples = self.format.frame_samples,
            "🎤 Capture device open"
        );
        Ok(())
    }

    /// Start delivering frames to `on_frame` until [`pause`](Self::pause).
    pub fn record<F>(&mut self, on_frame: F) -> RealtimeResult<()>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        match self.status {
            CaptureStatus::Closed => {
                return Err(RealtimeError::InvalidState(
                    "capture device is not open".to_string(),
                ))
            }
            CaptureStatus::Recording => {
                return Err(RealtimeError::InvalidState(
                    "capture is already recording".to_string(),
                ))
            }
            CaptureStatus::Paused => {}
        }

        let mut chunker = FrameChunker {
            frame_samples: self.format.frame_samples.max(1),
            buffer: Vec::with_capacity(self.format.frame_samples),
            on_frame,
            last_frame: Arc::clone(&self.last_frame),
        };
        self.device.start(Box::new(move |data: &[i16]| chunker.push(data)))?;
        self.status = CaptureStatus::Recording;
        debug!("▶️ Capture recording");
        Ok(())
    }

    /// Stop delivery; the device stays open. A partial frame is discarded.
    pub fn pause(&mut self) -> RealtimeResult<()> {
        if self.status != CaptureStatus::Recording {
            return Ok(());
        }
        self.device.stop()?;
        self.status = CaptureStatus::Paused;
        debug!("⏸️ Capture paused");
        Ok(())
    }

    /// Close the device. Safe to call in any state.
    pub fn end(&mut self) {
        if self.status == CaptureStatus::Closed {
            return;
        }
        if self.status == CaptureStatus::Recording {
            if let Err(e) = self.device.stop() {
                warn!("Capture stop failed during close: {}", e);
            }
        }
        self.device.close();
        self.status = CaptureStatus::Closed;
        if let Ok(mut last) = self.last_frame.lock() {
            last.clear();
        }
        info!("🎤 Capture device closed");
    }

    /// Spectrum of the most recent frame, for visualization only.
    pub fn frequencies(&self, bins: usize) -> Vec<f32> {
        let last = match self.last_frame.lock() {
            Ok(last) => last.clone(),
            Err(_) => return vec![0.0; bins],
        };
        spectrum(&last, bins)
    }
}
